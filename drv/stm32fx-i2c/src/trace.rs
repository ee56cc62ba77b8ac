// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-transfer event trace
//!
//! A fixed ring of entries collected while the protocol engine runs, for
//! post-mortem inspection of a transfer.  Each entry pins one observed
//! status word: repeated samples of the same status collapse into a count
//! rather than new entries, and engine events annotate whichever entry is
//! current.  The ring is a pure observer; nothing in the protocol consults
//! it.
//!
//! The buffer lives inside the per-bus transfer state, so release builds
//! without the `trace` feature carry neither the memory nor the sampling
//! work.

/// What the engine did with the status it observed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Nothing recorded against this status yet
    None,
    /// Engine entered
    Enter,
    /// Advanced to the next message; parameter is the count still queued
    NextMessage,
    /// Address byte written; parameter is the target address
    SendAddress,
    /// ACK cleared ahead of a 1-byte read
    SetupRead1,
    /// POS and ACK set ahead of a 2-byte read
    SetupRead2,
    /// Zero-length message skipped
    EmptyMessage,
    /// Address acknowledged
    AddressAcked,
    /// Address acknowledged; STOP armed before the single byte arrives
    ReadOneArmed,
    /// Address acknowledged; ACK dropped for the 2-byte tail
    ReadTwoArmed,
    /// Address not acknowledged; transfer aborted
    AddressNacked,
    /// One byte taken from DR
    ReadByte,
    /// DR full but the shift register still filling; waiting
    ShiftWait,
    /// Both bytes of a 2-byte read drained after STOP
    ReadTwo,
    /// Tail of a long read; parameter is the remaining count at the event
    ReadTail,
    /// Read state not recognized
    ReadError,
    /// One byte written to DR; parameter is the remaining count before it
    WriteByte,
    /// STOP armed after the last written byte
    WriteStop,
    /// Repeated START armed for the next message
    WriteRestart,
    /// Next message continues without a restart
    WriteNoRestart,
    /// Next message carries a flag the write path does not recognize
    WriteFlagError,
    /// Write state not recognized
    WriteError,
    /// Entered with nothing left to do
    EmptyCall,
    /// Polled entry found the hardware not ready
    NotReady,
    /// State not recognized; transfer abandoned
    StateError,
    /// Terminal state reached
    Shutdown,
}

/// Number of ring entries.
#[cfg(feature = "trace")]
pub const DEPTH: usize = 32;

#[cfg(feature = "trace")]
#[derive(Copy, Clone, Debug)]
pub struct Entry {
    /// Combined SR1 | SR2 << 16 as the engine saw it
    pub status: u32,
    /// How many consecutive samples matched this status
    pub count: u32,
    /// Last event recorded against this status
    pub event: Event,
    /// Event parameter
    pub parm: u32,
    /// Time of the first sample, µs
    pub time: u64,
}

#[cfg(feature = "trace")]
impl Entry {
    const EMPTY: Self = Self {
        status: 0,
        count: 0,
        event: Event::None,
        parm: 0,
        time: 0,
    };
}

#[cfg(feature = "trace")]
pub struct TraceBuf {
    entries: [Entry; DEPTH],
    ndx: usize,
    start: u64,
    lost: u32,
}

#[cfg(feature = "trace")]
impl TraceBuf {
    pub const fn new() -> Self {
        Self {
            entries: [Entry::EMPTY; DEPTH],
            ndx: 0,
            start: 0,
            lost: 0,
        }
    }

    /// Restart collection for a new transfer.
    pub fn reset(&mut self, now: u64) {
        self.entries[0] = Entry::EMPTY;
        self.ndx = 0;
        self.start = now;
        self.lost = 0;
    }

    /// Record one status sample.  A repeat of the current entry's status
    /// bumps its count; a new status advances the ring.
    pub fn sample(&mut self, status: u32, now: u64) {
        let current = &mut self.entries[self.ndx];
        if current.count == 0 {
            current.status = status;
            current.count = 1;
            current.time = now;
        } else if status != current.status {
            if self.ndx + 1 >= DEPTH {
                // Out of entries; count what we drop.
                self.lost = self.lost.wrapping_add(1);
                return;
            }
            self.ndx += 1;
            self.entries[self.ndx] = Entry {
                status,
                count: 1,
                event: Event::None,
                parm: 0,
                time: now,
            };
        } else {
            current.count += 1;
        }
    }

    /// Annotate the current entry with an engine event.
    pub fn note(&mut self, event: Event, parm: u32) {
        let current = &mut self.entries[self.ndx];
        current.event = event;
        current.parm = parm;
    }

    /// The populated prefix of the ring.
    pub fn entries(&self) -> &[Entry] {
        if self.entries[0].count == 0 {
            &[]
        } else {
            &self.entries[..=self.ndx]
        }
    }

    /// Samples that arrived after the ring filled.
    pub fn lost(&self) -> u32 {
        self.lost
    }

    /// Emit the collected trace.
    pub fn dump(&self) {
        #[cfg(feature = "defmt")]
        {
            for (i, entry) in self.entries().iter().enumerate() {
                defmt::debug!(
                    "{=usize}. STATUS: {=u32:08x} COUNT: {=u32} EVENT: {} PARM: {=u32:08x} TIME: {=u64}",
                    i + 1,
                    entry.status,
                    entry.count,
                    entry.event,
                    entry.parm,
                    entry.time - self.start,
                );
            }
            if self.lost != 0 {
                defmt::warn!("trace table overflow, {=u32} samples dropped", self.lost);
            }
        }
    }
}
