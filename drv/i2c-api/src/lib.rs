// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client API for the STM32 F-series I2C controller driver
//!
//! An I2C transfer is described as a chain of [`I2cMsg`] records, each
//! carrying a target address, a flag set, and a byte buffer.  The driver
//! realizes the chain as a single bus transaction: one START, one address
//! phase per message (a repeated START between messages unless suppressed
//! with [`FLAG_NORESTART`]), and a single closing STOP.
//!
//! Transfer outcomes are reported as a [`ResponseCode`].  The codes are
//! deliberately disjoint: the caller is not expected to handle each one
//! differently, but upstack software gets some modicum of context
//! surrounding the error.

#![cfg_attr(not(test), no_std)]

use core::marker::PhantomData;

use num_derive::FromPrimitive;

/// The message is a read; the driver fills the buffer from the target.
pub const FLAG_READ: u16 = 0x0001;

/// The target address is 10 bits wide.
pub const FLAG_TEN: u16 = 0x0002;

/// Continue the byte stream of the previous message without a repeated
/// START: no new START or address phase is emitted at the boundary.
pub const FLAG_NORESTART: u16 = 0x0080;

/// The response code returned from a transfer.
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum ResponseCode {
    /// No completion within the transfer deadline
    TimedOut = 1,
    /// Misplaced START or STOP observed on the bus
    BusError = 2,
    /// Lost arbitration against another master; the caller may retry
    ArbitrationLost = 3,
    /// Address or data byte was not acknowledged
    Nack = 4,
    /// Receiver overrun or transmitter underrun
    Overrun = 5,
    /// Packet error check mismatch (SMBus, reserved)
    Protocol = 6,
    /// Hardware SCL-low timeout
    BusTimeout = 7,
    /// Bus stayed busy after the transfer window
    Busy = 8,
    /// Woken by a signal and aborted
    Interrupted = 9,
}

impl From<ResponseCode> for i32 {
    /// Errno-style signed result: negative magnitudes map to the code.
    fn from(code: ResponseCode) -> Self {
        -(code as u32 as i32)
    }
}

/// The I2C controllers found on these parts.  The numbering follows the
/// peripheral numbering in the reference manual.
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Controller {
    I2C1 = 1,
    I2C2 = 2,
    I2C3 = 3,
}

/// One message in a transfer chain.
///
/// The buffer is held as a raw cursor so that a single record shape covers
/// both directions and so the driver's event handler can walk it from
/// interrupt context.  The lifetime parameter pins the borrow of the
/// caller's buffer for as long as the message is alive.
pub struct I2cMsg<'a> {
    addr: u16,
    flags: u16,
    ptr: *mut u8,
    len: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> I2cMsg<'a> {
    /// A message that sends `data` to `addr`.
    pub fn write(addr: u16, data: &'a [u8]) -> Self {
        Self {
            addr,
            flags: 0,
            // The driver never stores through the cursor of a message
            // whose FLAG_READ is clear, so handing out the pointer mutably
            // here is sound.
            ptr: data.as_ptr() as *mut u8,
            len: data.len(),
            _marker: PhantomData,
        }
    }

    /// A message that fills `buffer` from `addr`.
    pub fn read(addr: u16, buffer: &'a mut [u8]) -> Self {
        Self {
            addr,
            flags: FLAG_READ,
            ptr: buffer.as_mut_ptr(),
            len: buffer.len(),
            _marker: PhantomData,
        }
    }

    /// OR additional flags (e.g. [`FLAG_NORESTART`], [`FLAG_TEN`]) into the
    /// message.
    #[must_use]
    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags |= flags;
        self
    }

    pub fn addr(&self) -> u16 {
        self.addr
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Driver-side access to the buffer cursor.
    ///
    /// Writing through the returned pointer is only permitted when the
    /// message carries [`FLAG_READ`]; see [`I2cMsg::write`].
    pub fn buf(&self) -> *mut u8 {
        self.ptr
    }
}
