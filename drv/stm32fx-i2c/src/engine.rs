// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The transfer engine
//!
//! One entry per hardware event (or per poll tick): the engine samples SR1,
//! picks exactly one branch, mutates the transfer state, and issues the
//! register writes that branch requires.  It never blocks.  The same code
//! runs from the event/error interrupt and from the polled dispatch loop.
//!
//! The branch bodies encode what this peripheral requires in what order,
//! not merely what the wire protocol does.  In particular:
//!
//! - SR1 is sampled alone on entry.  Reading SR2 clears a pending ADDR
//!   flag and lets the hardware advance, so SR2 is read only at the points
//!   where that is the intended effect.
//! - The ACK/POS policy for a read must be on the wire side of the ADDR
//!   clear.  For a 1-byte read ACK is dropped before the address phase
//!   completes; for a 2-byte read POS+ACK are set before and ACK dropped
//!   just after; for longer reads ACK stays up until three bytes remain.
//! - RXNE alone is unreliable on this silicon for multi-byte reads: a DR
//!   read issued near the end of the next byte's reception can be ignored
//!   by the controller, so the engine gates multi-byte progress on BTF and
//!   drains two bytes (DR plus shift register) at the tail.

use core::ptr;

use drv_i2c_api::{I2cMsg, FLAG_READ, FLAG_TEN};

use crate::regs::{self, Registers};
use crate::trace::Event;
use crate::{I2cBus, Platform, INTSTATE_DONE, INTSTATE_WAITING, POLLED};
use core::sync::atomic::Ordering;

/// Where the engine stands in the message chain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Progress {
    /// Between messages: the next engine entry latches the next message
    /// (or, with nothing queued, the transfer is finished).
    NextMessage,
    /// Inside the current message with this many bytes still to move.
    InFlight(usize),
}

/// Per-bus record of the executing message chain.
///
/// The cursors are raw because the engine walks them from interrupt
/// context, outside the borrow that produced them.
pub(crate) struct Transfer {
    /// Current message record; advances past the current message as soon
    /// as it is latched, except on the last, and is nulled at completion.
    pub msgv: *mut I2cMsg<'static>,
    /// Messages remaining, including the current one until it is latched
    pub msgc: usize,
    /// Byte cursor into the current message's buffer
    pub ptr: *mut u8,
    pub progress: Progress,
    /// Length of the current message, selecting the read sub-protocol
    pub total_len: usize,
    /// Flags of the current message
    pub flags: u16,
    /// True from address emission until the address-cleared (or NACKed)
    /// event is observed
    pub check_addr_ack: bool,
    /// SR1 | SR2 << 16 snapshot from the most recent engine entry
    pub status: u32,
    #[cfg(feature = "trace")]
    pub trace: crate::trace::TraceBuf,
}

// Safety: the raw cursors are only dereferenced by the engine, and the
// engine only runs between a dispatcher priming the state (with the lock
// held and the caller's borrows alive) and the terminal entry that nulls
// msgv.  Interrupt sources are quiesced before the dispatcher returns.
unsafe impl Send for Transfer {}

impl Transfer {
    pub const fn idle() -> Self {
        Self {
            msgv: ptr::null_mut(),
            msgc: 0,
            ptr: ptr::null_mut(),
            progress: Progress::NextMessage,
            total_len: 0,
            flags: 0,
            check_addr_ack: false,
            status: 0,
            #[cfg(feature = "trace")]
            trace: crate::trace::TraceBuf::new(),
        }
    }

    /// The whole chain has been consumed.
    pub fn terminal(&self) -> bool {
        self.progress == Progress::NextMessage && self.msgc == 0
    }

    #[cfg(feature = "trace")]
    #[inline]
    fn note(&mut self, event: Event, parm: u32) {
        self.trace.note(event, parm);
    }

    #[cfg(not(feature = "trace"))]
    #[inline]
    fn note(&mut self, _event: Event, _parm: u32) {}
}

impl<R: Registers, P: Platform> I2cBus<R, P> {
    /// Advance the transfer by one event.
    pub(crate) fn event_step(&self, t: &mut Transfer) {
        // SR1 only: reading SR2 here would clear ADDR before the branch
        // bodies have set the ACK/POS policy the data phase needs.
        let mut status = u32::from(self.regs.get(regs::SR1));
        t.status = status;

        #[cfg(feature = "trace")]
        t.trace.sample(status, self.platform.now_us());
        t.note(Event::Enter, 0);

        // Message advance: runs when the previous message has been fully
        // handled (or on the very first entry, which the dispatcher
        // arranges to look the same way).
        if t.progress == Progress::NextMessage && t.msgc > 0 {
            // Safety: msgv points into the caller's message slice; see the
            // Transfer Send rationale.
            let msg = unsafe { &*t.msgv };
            t.ptr = msg.buf();
            t.progress = Progress::InFlight(msg.len());
            t.total_len = msg.len();
            t.flags = msg.flags();
            t.msgc -= 1;
            if t.msgc > 0 {
                t.msgv = unsafe { t.msgv.add(1) };
            }
            t.note(Event::NextMessage, t.msgc as u32);
        }

        if status & u32::from(regs::SR1_SB) != 0 {
            self.start_bit_set(t);
        } else if !POLLED
            && status & u32::from(regs::SR1_ADDR) == 0
            && t.check_addr_ack
        {
            // The hardware silently NACKed the address: no ADDR between
            // the address emission and this (error-interrupt) entry.
            // Terminate the chain and free the bus.
            t.progress = Progress::NextMessage;
            t.msgc = 0;
            t.check_addr_ack = false;
            self.send_stop();
            let addr = unsafe { u32::from((*t.msgv).addr()) };
            t.note(Event::AddressNacked, addr);
        } else if t.flags & FLAG_READ != 0
            && status & u32::from(regs::SR1_ADDR) != 0
            && t.check_addr_ack
        {
            self.read_addr_cleared(t, &mut status);
        } else if t.flags & FLAG_READ == 0
            && status & u32::from(regs::SR1_ADDR | regs::SR1_TXE) != 0
        {
            self.write_event(t, &mut status);
        } else if t.flags & FLAG_READ != 0
            && status & u32::from(regs::SR1_RXNE) != 0
        {
            self.read_event(t, &mut status);
        } else if t.terminal() {
            // Nothing left to do; this entry only has to shut down.
            status |= u32::from(self.regs.get(regs::SR2)) << 16;
            t.note(Event::EmptyCall, 0);
        } else if POLLED {
            // The hardware simply has nothing for us yet; the poll loop
            // will call again.
            t.note(Event::NotReady, 0);
        } else {
            // Interrupt entry in a state the engine does not recognize.
            status |= u32::from(self.regs.get(regs::SR2)) << 16;
            t.progress = Progress::NextMessage;
            t.msgc = 0;
            t.note(Event::StateError, 0);
        }

        t.status = status;

        if t.terminal() {
            t.note(Event::Shutdown, 0);
            t.msgv = ptr::null_mut();

            if POLLED {
                self.intstate.store(INTSTATE_DONE, Ordering::Release);
            } else {
                self.regs.modify(regs::CR2, regs::CR2_ALLINTS, 0);

                // Post the completion only for a waiter that announced
                // itself; anything else would be a spurious wakeup for a
                // later transfer.
                if self.intstate.load(Ordering::Acquire) == INTSTATE_WAITING {
                    self.platform.post_completion();
                    self.intstate.store(INTSTATE_DONE, Ordering::Release);
                }
            }
        }
    }

    /// START generated: emit the address byte, with the ACK/POS policy the
    /// imminent data phase requires already in place.
    fn start_bit_set(&self, t: &mut Transfer) {
        match t.progress {
            Progress::InFlight(n) if n > 0 => {
                if t.total_len == 1 && t.flags & FLAG_READ != 0 {
                    // Single byte: the one byte must be NACKed, and POS
                    // may be left over from an earlier 2-byte receive.
                    self.regs.modify(regs::CR1, regs::CR1_POS, 0);
                    self.regs.modify(regs::CR1, regs::CR1_ACK, 0);
                    t.note(Event::SetupRead1, 0);
                } else if t.total_len == 2 && t.flags & FLAG_READ != 0 {
                    // Two bytes: with POS up, the coming NACK lands on the
                    // second byte.
                    self.regs.modify(regs::CR1, 0, regs::CR1_POS);
                    self.regs.modify(regs::CR1, 0, regs::CR1_ACK);
                    t.note(Event::SetupRead2, 0);
                } else {
                    self.regs.modify(regs::CR1, regs::CR1_POS, 0);
                    self.regs.modify(regs::CR1, 0, regs::CR1_ACK);
                }

                let addr = unsafe { (*t.msgv).addr() };
                let byte = if t.flags & FLAG_TEN != 0 {
                    // TODO: 10-bit addressing must emit the 0b11110xx
                    // header byte (with the R/W bit) followed by the low
                    // eight address bits; until then a placeholder goes
                    // out.
                    0
                } else {
                    (addr << 1) | (t.flags & FLAG_READ)
                };
                self.regs.put(regs::DR, byte);
                t.check_addr_ack = true;
                t.note(Event::SendAddress, u32::from(addr));
            }
            _ => {
                // Zero-length message: nothing to address.  Arrange for
                // the next entry to advance the chain; ITBUFEN guarantees
                // that entry happens even with no byte traffic.
                t.progress = Progress::NextMessage;
                self.regs.modify(regs::CR2, 0, regs::CR2_ITBUFEN);
                t.note(Event::EmptyMessage, 0);
            }
        }
    }

    /// Read-mode address phase completed.  The order of operations here is
    /// the delicate part: what is written before and after the SR2 read
    /// decides which byte the hardware NACKs and when the STOP lands.
    fn read_addr_cleared(&self, t: &mut Transfer, status: &mut u32) {
        t.check_addr_ack = false;

        match t.progress {
            Progress::InFlight(1) if t.total_len == 1 => {
                // The lone byte arrives with only RXNE to show for it, so
                // buffer events must be able to raise the interrupt.
                self.regs.modify(regs::CR2, 0, regs::CR2_ITBUFEN);
                *status |= u32::from(self.regs.get(regs::SR2)) << 16;
                self.send_stop();
                t.progress = Progress::InFlight(0);
                t.note(Event::ReadOneArmed, 0);
            }
            Progress::InFlight(2) if t.total_len == 2 => {
                *status |= u32::from(self.regs.get(regs::SR2)) << 16;
                // POS went up before the address; dropping ACK now makes
                // the NACK fall on the second byte.
                self.regs.modify(regs::CR1, regs::CR1_ACK, 0);
                t.note(Event::ReadTwoArmed, 0);
            }
            _ => {
                // N >= 3: ACK went up with the START; just let the data
                // phase begin.
                *status |= u32::from(self.regs.get(regs::SR2)) << 16;
                t.note(Event::AddressAcked, 0);
            }
        }
    }

    /// Write-mode event: the address phase completed or the transmit
    /// buffer drained.
    fn write_event(&self, t: &mut Transfer, status: &mut u32) {
        if *status & u32::from(regs::SR1_ADDR) != 0 {
            *status |= u32::from(self.regs.get(regs::SR2)) << 16;
        }
        t.check_addr_ack = false;

        match t.progress {
            Progress::InFlight(n @ 1..) => {
                // Safety: ptr walks the current message's buffer; the
                // dispatcher's lock pins the borrow.
                let byte = unsafe {
                    let b = *t.ptr;
                    t.ptr = t.ptr.add(1);
                    b
                };
                self.regs.put(regs::DR, u16::from(byte));
                t.note(Event::WriteByte, n as u32);
                t.progress = Progress::InFlight(n - 1);
            }
            Progress::InFlight(0) => {
                // Message finished; what happens at the boundary depends
                // on what comes next.
                if t.msgc == 0 {
                    self.send_stop();
                    t.progress = Progress::NextMessage;
                    t.note(Event::WriteStop, 0);
                } else {
                    // msgv already points at the next message.
                    let next_flags = unsafe { (*t.msgv).flags() };
                    if next_flags == 0 || next_flags & FLAG_READ != 0 {
                        self.send_start();
                        t.progress = Progress::NextMessage;
                        t.note(Event::WriteRestart, 0);
                    } else if next_flags & drv_i2c_api::FLAG_NORESTART != 0 {
                        // The byte stream continues straight through the
                        // boundary.
                        t.progress = Progress::NextMessage;
                        t.note(Event::WriteNoRestart, 0);
                    } else {
                        t.note(Event::WriteFlagError, u32::from(next_flags));
                    }
                }
            }
            Progress::NextMessage => {
                t.note(Event::WriteError, 0);
            }
        }
    }

    /// Read-mode data phase.  Keyed on (message length, bytes remaining,
    /// BTF); see the module comment for why BTF gates everything past the
    /// single-byte case.
    fn read_event(&self, t: &mut Transfer, status: &mut u32) {
        let btf = *status & u32::from(regs::SR1_BTF) != 0;

        match (t.total_len, t.progress, btf) {
            (1, Progress::InFlight(0), _) => {
                self.read_dr_into(t);
                t.progress = Progress::NextMessage;
                t.note(Event::ReadByte, 0);
            }
            (2, Progress::InFlight(2), false) => {
                // DR holds the first byte but the shift register is still
                // filling; come back on BTF.
                t.note(Event::ShiftWait, 0);
            }
            (2, Progress::InFlight(2), true) => {
                // Both bytes are on chip (NACK already sent, SCL held).
                // STOP first, then drain DR and the shift register.
                self.send_stop();
                self.read_dr_into(t);
                self.read_dr_into(t);
                t.progress = Progress::NextMessage;
                t.note(Event::ReadTwo, 0);
            }
            (3.., _, false) => {
                t.note(Event::ShiftWait, 0);
            }
            (3.., Progress::InFlight(n), true) if n >= 4 => {
                self.read_dr_into(t);
                t.progress = Progress::InFlight(n - 1);
                t.note(Event::ReadByte, 0);
            }
            (3.., Progress::InFlight(3), true) => {
                // Byte N-2 is in DR, N-1 in the shift register.  Drop ACK
                // so byte N is NACKed, then free DR; the next BTF will
                // mean the last two bytes are both on chip.
                t.note(Event::ReadTail, 3);
                self.regs.modify(regs::CR1, regs::CR1_ACK, 0);
                self.read_dr_into(t);
                t.progress = Progress::InFlight(2);
            }
            (3.., Progress::InFlight(2), true) => {
                t.note(Event::ReadTail, 2);
                self.send_stop();
                self.read_dr_into(t);
                self.read_dr_into(t);
                t.progress = Progress::NextMessage;
            }
            _ => {
                t.progress = Progress::NextMessage;
                t.msgc = 0;
                t.note(Event::ReadError, 0);
            }
        }

        *status |= u32::from(self.regs.get(regs::SR2)) << 16;
    }

    fn read_dr_into(&self, t: &mut Transfer) {
        let byte = self.regs.get(regs::DR) as u8;
        // Safety: ptr walks the current read message's buffer; the
        // dispatcher's lock pins the borrow.
        unsafe {
            *t.ptr = byte;
            t.ptr = t.ptr.add(1);
        }
    }
}
