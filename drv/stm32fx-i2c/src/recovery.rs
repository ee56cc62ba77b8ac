// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus recovery by pin bit-banging
//!
//! A target that was mid-byte when the controller went away can hold SDA
//! low forever, wedging the bus.  The cure is manual: take the pins back
//! from the peripheral, clock SCL until the target lets go of SDA, then
//! draw a START/STOP pair to reset every target's state machine.

use drv_i2c_api::ResponseCode;

use crate::regs::Registers;
use crate::{I2cBus, Platform};

/// Direct control of one port's SCL/SDA, for recovery only.
///
/// Between `begin` and `finish` the pins must be plain open-drain GPIO
/// outputs (readable, as open-drain outputs are), detached from the
/// peripheral.  Drive the lines high before switching direction so the
/// handover does not glitch the bus.
pub trait RecoveryPins {
    /// Take direct control of the pins.
    fn begin(&self);

    /// Return the pins to their I2C alternate function.
    fn finish(&self);

    fn set_scl(&self, high: bool);

    fn set_sda(&self, high: bool);

    fn read_scl(&self) -> bool;

    fn read_sda(&self) -> bool;
}

/// Half-period of the recovery clock, µs.
const HALF_PERIOD_US: u32 = 10;

/// Pulses to try before declaring the bus unrecoverable; likewise the
/// bound on clock-stretch waits within each pulse.
const MAX_PULSES: u32 = 10;

impl<R: Registers, P: Platform> I2cBus<R, P> {
    pub(crate) fn reset(
        &self,
        pins: &dyn RecoveryPins,
    ) -> Result<(), ResponseCode> {
        self.lock();
        let result = self.recover(pins);
        self.unlock();
        result
    }

    /// The unwedge procedure.  On failure the port is left torn down with
    /// the pins still in GPIO mode, mirroring how far the procedure got;
    /// the caller can retry.
    fn recover(&self, pins: &dyn RecoveryPins) -> Result<(), ResponseCode> {
        self.deinit_hardware();
        pins.begin();

        // Let SDA float high; if a target is holding it, clock the bus
        // until the byte it thinks it is sending has drained.
        pins.set_sda(true);

        let mut pulses = 0;
        while !pins.read_sda() {
            if pulses >= MAX_PULSES {
                return Err(ResponseCode::Busy);
            }
            pulses += 1;

            // A target may stretch the clock; wait it out, within bounds.
            let mut stretch = 0;
            while !pins.read_scl() {
                if stretch >= MAX_PULSES {
                    return Err(ResponseCode::Busy);
                }
                stretch += 1;
                self.platform.udelay(HALF_PERIOD_US);
            }

            pins.set_scl(false);
            self.platform.udelay(HALF_PERIOD_US);
            pins.set_scl(true);
            self.platform.udelay(HALF_PERIOD_US);
        }

        // A START followed by a STOP resets target state machines.
        pins.set_sda(false);
        self.platform.udelay(HALF_PERIOD_US);
        pins.set_scl(false);
        self.platform.udelay(HALF_PERIOD_US);
        pins.set_scl(true);
        self.platform.udelay(HALF_PERIOD_US);
        pins.set_sda(true);
        self.platform.udelay(HALF_PERIOD_US);

        pins.finish();
        self.init_hardware();
        Ok(())
    }
}
