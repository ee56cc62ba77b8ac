// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Master-mode driver for the I2C controller found on STM32 F1/F2/F4-class
//! parts (the SR1/SR2/DR/CCR/TRISE register-file variant, which is
//! register-compatible across those families).
//!
//! The driver turns a chain of [`I2cMsg`] records into one bus transaction,
//! driven by an event-at-a-time engine (the `engine` module) that encodes this
//! peripheral's order-sensitive handling of the ADDR flag, the data
//! register, and the shift register.  Dispatch is either interrupt-driven
//! (default) or polled (`polled` feature): in the first case the transfer
//! blocks on a completion signal raised from the interrupt handler, in the
//! second the dispatcher calls the engine in a tight loop.
//!
//! Everything the driver needs from the surrounding system (peripheral
//! clock gating, pin configuration, interrupt attachment, a microsecond
//! clock, and the blocking completion primitive) comes in through the
//! [`Platform`] trait, and all register I/O goes through
//! [`regs::Registers`], so the core is testable against a simulated
//! register model.
//!
//! A bus is shared: any number of [`I2cDevice`] handles may be attached to
//! one [`I2cBus`].  The hardware is brought up when the first handle
//! attaches and torn down when the last one drops, and a per-bus lock
//! serializes transfers.

#![cfg_attr(not(test), no_std)]

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use critical_section::Mutex;

use drv_i2c_api::{I2cMsg, ResponseCode};
pub use drv_i2c_api::{Controller, FLAG_NORESTART, FLAG_READ, FLAG_TEN};

mod engine;
pub mod regs;
pub mod trace;

#[cfg(feature = "bus-recovery")]
mod recovery;
#[cfg(feature = "bus-recovery")]
pub use recovery::RecoveryPins;

#[cfg(test)]
mod sim;

use engine::{Progress, Transfer};
use regs::Registers;

/// Dispatch mode baked in at build time.  Both paths always compile; this
/// selects which one `process` uses.
pub(crate) const POLLED: bool = cfg!(feature = "polled");

pub(crate) const INTSTATE_IDLE: u8 = 0;
pub(crate) const INTSTATE_WAITING: u8 = 1;
pub(crate) const INTSTATE_DONE: u8 = 2;

/// Default bus frequency programmed at attach and used by fresh devices.
pub const DEFAULT_FREQUENCY: u32 = 100_000;

/// How long the per-bus lock spins between claim attempts.
const LOCK_RETRY_US: u32 = 100;

/// Outcome of [`Platform::wait_completion`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitResult {
    /// The completion was posted.
    Signalled,
    /// The timeout elapsed first.
    TimedOut,
    /// The wait was interrupted (e.g. by a signal); the caller retries.
    Interrupted,
}

/// What the driver needs from the surrounding system.
///
/// One implementation per bus: the platform knows which port it serves, so
/// clock and pin operations take no port argument.
pub trait Platform {
    /// Frequency of the APB clock feeding the peripheral, in Hz.
    fn pclk_hz(&self) -> u32;

    /// Monotonic microsecond clock.
    fn now_us(&self) -> u64;

    /// Busy-wait for at least `us` microseconds.
    fn udelay(&self, us: u32);

    /// Gate the peripheral's bus clock on.
    fn enable_clock(&self);

    /// Gate the peripheral's bus clock off.
    fn disable_clock(&self);

    /// Pulse the peripheral's reset line.
    fn pulse_reset(&self);

    /// Put SCL/SDA into their open-drain alternate function.
    fn configure_pins(&self);

    /// Return SCL/SDA to their reset state.
    fn unconfigure_pins(&self);

    /// Attach and enable the event and error interrupt vectors, both
    /// routed to [`I2cBus::on_interrupt`].  Unused in polled dispatch.
    fn attach_interrupts(&self);

    /// Disable and detach the interrupt vectors.
    fn detach_interrupts(&self);

    /// Block until [`Platform::post_completion`] is called or `timeout_us`
    /// elapses.  Unused in polled dispatch.
    fn wait_completion(&self, timeout_us: u32) -> WaitResult;

    /// Wake the `wait_completion` caller.  Called from interrupt context.
    fn post_completion(&self);

    /// Runs before each transfer when the `fsmc-workaround` feature is
    /// active; the returned token is handed back to
    /// [`Platform::post_transfer_hook`].  The stock implementation for
    /// affected parts gates the FSMC clock off here, because FSMC and I2C1
    /// share a die-level resource and a transfer cannot complete with both
    /// enabled.
    fn pre_transfer_hook(&self) -> u32 {
        0
    }

    /// Runs after each transfer when the `fsmc-workaround` feature is
    /// active.
    fn post_transfer_hook(&self, _token: u32) {}
}

/// Immutable description of one physical port.
#[derive(Copy, Clone, Debug)]
pub struct BusConfig {
    pub controller: Controller,
    /// Static transfer deadline, µs.
    pub timeout_us: u32,
    /// Per-byte deadline contribution used with the `dynamic-timeout`
    /// feature; size it to the slowest bus rate in use.
    pub us_per_byte: u32,
}

impl BusConfig {
    pub const fn new(controller: Controller) -> Self {
        Self {
            controller,
            timeout_us: 500_000,
            us_per_byte: 500,
        }
    }
}

/// Per-port base addresses and RCC bit positions, for integrators wiring
/// up [`regs::Mmio`] and a [`Platform`].
pub mod ports {
    #[cfg(feature = "i2c1")]
    pub const I2C1_BASE: usize = 0x4000_5400;
    #[cfg(feature = "i2c1")]
    pub const I2C1_APB1_BIT: u32 = 1 << 21;

    #[cfg(feature = "i2c2")]
    pub const I2C2_BASE: usize = 0x4000_5800;
    #[cfg(feature = "i2c2")]
    pub const I2C2_APB1_BIT: u32 = 1 << 22;

    #[cfg(feature = "i2c3")]
    pub const I2C3_BASE: usize = 0x4000_5c00;
    #[cfg(feature = "i2c3")]
    pub const I2C3_APB1_BIT: u32 = 1 << 23;
}

/// One physical I2C port.
///
/// Designed to live in a `static`: construction is `const`, all methods
/// take `&self`, and the transfer state sits behind a critical-section
/// cell so the interrupt handler and the dispatcher can share it.
pub struct I2cBus<R: Registers, P: Platform> {
    config: BusConfig,
    pub(crate) regs: R,
    pub(crate) platform: P,
    refs: Mutex<Cell<u32>>,
    excl: AtomicBool,
    pub(crate) intstate: AtomicU8,
    state: Mutex<RefCell<Transfer>>,
}

impl<R: Registers, P: Platform> I2cBus<R, P> {
    pub const fn new(config: BusConfig, regs: R, platform: P) -> Self {
        Self {
            config,
            regs,
            platform,
            refs: Mutex::new(Cell::new(0)),
            excl: AtomicBool::new(false),
            intstate: AtomicU8::new(INTSTATE_IDLE),
            state: Mutex::new(RefCell::new(Transfer::idle())),
        }
    }

    /// Open a caller handle on this bus.  The first attachment powers up
    /// and configures the hardware.
    pub fn attach(&self) -> I2cDevice<'_, R, P> {
        // The refcount transition and the bring-up it triggers must be
        // atomic against other openers and against interrupts.
        critical_section::with(|cs| {
            let refs = self.refs.borrow(cs);
            let count = refs.get();
            refs.set(count + 1);
            if count == 0 {
                self.init_hardware();
            }
        });

        I2cDevice {
            bus: self,
            address: 0,
            flags: 0,
            frequency: DEFAULT_FREQUENCY,
        }
    }

    /// Entry point for both the event and the error interrupt vectors.
    pub fn on_interrupt(&self) {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            self.event_step(&mut state);
        });
    }

    fn release(&self) {
        critical_section::with(|cs| {
            let refs = self.refs.borrow(cs);
            let count = refs.get();
            debug_assert!(count > 0);
            refs.set(count - 1);
            if count == 1 {
                self.deinit_hardware();
            }
        });
    }

    fn init_hardware(&self) {
        self.platform.enable_clock();
        self.platform.pulse_reset();
        self.platform.configure_pins();
        if !POLLED {
            self.platform.attach_interrupts();
        }

        // Program the peripheral-clock field; a full CR2 write also leaves
        // every interrupt source disabled.
        let freq_mhz = (self.platform.pclk_hz() / 1_000_000) as u16;
        self.regs.put(regs::CR2, freq_mhz & regs::CR2_FREQ_MASK);
        self.set_clock(DEFAULT_FREQUENCY);

        self.regs.put(regs::CR1, regs::CR1_PE);
    }

    fn deinit_hardware(&self) {
        self.regs.put(regs::CR1, 0);
        self.platform.unconfigure_pins();
        if !POLLED {
            self.platform.detach_interrupts();
        }
        self.platform.disable_clock();
    }

    /// Program CCR and TRISE for the requested bus frequency.  Must run
    /// with the peripheral disabled, so CR1 is parked and restored.
    fn set_clock(&self, frequency: u32) {
        let cr1 = self.regs.get(regs::CR1);
        self.regs.put(regs::CR1, cr1 & !regs::CR1_PE);

        let pclk = self.platform.pclk_hz();
        let freq_mhz = pclk / 1_000_000;
        let mut ccr: u16 = 0;
        let trise: u16;

        if frequency <= 100_000 {
            let mut speed = (pclk / (frequency << 1)) as u16;
            if speed < 4 {
                speed = 4;
            }
            ccr |= speed;
            trise = (freq_mhz + 1) as u16;
        } else {
            cfg_if::cfg_if! {
                if #[cfg(feature = "duty16-9")] {
                    let mut speed = (pclk / (frequency * 25)) as u16;
                    ccr |= regs::CCR_DUTY | regs::CCR_FS;
                } else {
                    let mut speed = (pclk / (frequency * 3)) as u16;
                    ccr |= regs::CCR_FS;
                }
            }
            if speed < 1 {
                speed = 1;
            }
            ccr |= speed;
            trise = ((freq_mhz * 300) / 1000 + 1) as u16;
        }

        self.regs.put(regs::CCR, ccr);
        self.regs.put(regs::TRISE, trise);

        // Bit 14 of OAR1 must be written as one and kept there.
        self.regs.put(regs::OAR1, regs::OAR1_ONE);

        self.regs.put(regs::CR1, cr1);
    }

    pub(crate) fn send_start(&self) {
        // ACK is dropped here and raised per-message once the length is
        // known; see the engine's address handling.
        self.regs.modify(regs::CR1, regs::CR1_ACK, regs::CR1_START);
    }

    pub(crate) fn send_stop(&self) {
        self.regs.modify(regs::CR1, regs::CR1_ACK, regs::CR1_STOP);
    }

    /// Clear pending START/STOP/PEC requests.  The manual forbids other
    /// CR1 writes while one of these is pending, but a bit the hardware
    /// never got to act on must be cleared by software.
    fn clear_start(&self) {
        self.regs.modify(
            regs::CR1,
            regs::CR1_START | regs::CR1_STOP | regs::CR1_PEC,
            0,
        );
    }

    /// Combined SR1 | SR2 << 16.
    fn get_status(&self) -> u32 {
        let status = u32::from(self.regs.get(regs::SR1));
        status | u32::from(self.regs.get(regs::SR2)) << 16
    }

    /// Wait for a lingering STOP to finish.  STOP may also be stuck set by
    /// a hardware timeout, so that flag ends the wait too.  A fall-through
    /// here is logged, not fatal: the transfer proceeds and will most
    /// likely report a busy bus.
    fn wait_stop(&self) {
        let timeout = u64::from(self.config.timeout_us);
        let start = self.platform.now_us();

        loop {
            if self.regs.get(regs::CR1) & regs::CR1_STOP == 0 {
                return;
            }
            if self.regs.get(regs::SR1) & regs::SR1_TIMEOUT != 0 {
                return;
            }
            if self.platform.now_us().wrapping_sub(start) >= timeout {
                break;
            }
        }

        #[cfg(feature = "defmt")]
        defmt::warn!("i2c: STOP still pending after settle timeout");
    }

    fn transfer_timeout_us(&self, total_bytes: usize) -> u32 {
        if cfg!(feature = "dynamic-timeout") {
            self.config.us_per_byte.saturating_mul(total_bytes as u32)
        } else {
            self.config.timeout_us
        }
    }

    fn lock(&self) {
        while self
            .excl
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.platform.udelay(LOCK_RETRY_US);
        }
    }

    fn unlock(&self) {
        self.excl.store(false, Ordering::Release);
    }

    /// Interrupt-driven completion wait.  The handshake byte is the
    /// authority: a posted completion only counts once DONE is observed,
    /// and the wait is restarted after an interrupted sleep.
    pub(crate) fn waitdone_interrupt(
        &self,
        total_bytes: usize,
    ) -> Result<(), ResponseCode> {
        // Announce the waiter before any interrupt source can fire, so a
        // transfer that completes instantly still posts.
        self.intstate.store(INTSTATE_WAITING, Ordering::Release);
        self.regs
            .modify(regs::CR2, 0, regs::CR2_ITERREN | regs::CR2_ITEVFEN);

        let timeout = self.transfer_timeout_us(total_bytes);
        let deadline = self.platform.now_us() + u64::from(timeout);

        let result = loop {
            if self.intstate.load(Ordering::Acquire) == INTSTATE_DONE {
                break Ok(());
            }
            let now = self.platform.now_us();
            if now >= deadline {
                break Err(ResponseCode::TimedOut);
            }
            // Signalled, TimedOut, and Interrupted all just re-check: the
            // handshake and the clock decide, not the wait primitive.
            let _ = self.platform.wait_completion((deadline - now) as u32);
        };

        self.intstate.store(INTSTATE_IDLE, Ordering::Release);
        self.regs.modify(regs::CR2, regs::CR2_ALLINTS, 0);
        result
    }

    /// Polled completion wait: drive the engine until it reports done or
    /// the deadline expires.
    pub(crate) fn waitdone_polled(
        &self,
        total_bytes: usize,
    ) -> Result<(), ResponseCode> {
        self.intstate.store(INTSTATE_WAITING, Ordering::Release);

        let timeout = u64::from(self.transfer_timeout_us(total_bytes));
        let start = self.platform.now_us();

        let result = loop {
            critical_section::with(|cs| {
                let mut state = self.state.borrow_ref_mut(cs);
                self.event_step(&mut state);
            });

            if self.intstate.load(Ordering::Acquire) == INTSTATE_DONE {
                break Ok(());
            }
            if self.platform.now_us().wrapping_sub(start) >= timeout {
                break Err(ResponseCode::TimedOut);
            }
        };

        self.intstate.store(INTSTATE_IDLE, Ordering::Release);
        result
    }

    /// Run one transfer.  See the module docs for the overall shape; the
    /// returned error is the classification of the final status word.
    pub(crate) fn process(
        &self,
        msgs: &mut [I2cMsg<'_>],
        frequency: u32,
    ) -> Result<(), ResponseCode> {
        assert!(!msgs.is_empty());
        let total_bytes: usize = msgs.iter().map(|m| m.len()).sum();

        self.lock();

        cfg_if::cfg_if! {
            if #[cfg(feature = "fsmc-workaround")] {
                // A pending STOP cannot complete while the FSMC is
                // enabled, so the settle wait moves to the end of the
                // transfer, after the hook has run.
                let fsmc_token = self.platform.pre_transfer_hook();
            } else {
                self.wait_stop();
            }
        }

        // Drop stale error flags, then stale START/STOP/PEC requests.
        self.regs.put(regs::SR1, 0);
        self.clear_start();

        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.msgv = msgs.as_mut_ptr() as *mut I2cMsg<'static>;
            state.msgc = msgs.len();
            state.progress = Progress::NextMessage;
            state.check_addr_ack = false;
            state.status = 0;
            #[cfg(feature = "trace")]
            state.trace.reset(self.platform.now_us());
        });

        self.set_clock(frequency);
        self.send_start();

        let wait = if POLLED {
            self.waitdone_polled(total_bytes)
        } else {
            self.waitdone_interrupt(total_bytes)
        };

        let status = match wait {
            Ok(()) => {
                // Keep only SR1: the engine saw the transfer to its end,
                // so a stale BUSY in the snapshot's SR2 half means
                // nothing.
                let captured = critical_section::with(|cs| {
                    self.state.borrow_ref(cs).status
                });
                captured & 0xffff
            }
            Err(_) => {
                let status = self.get_status();
                self.clear_start();
                if POLLED {
                    // With no address-NACK detection in polled dispatch, a
                    // timeout may just mean an unacknowledged address;
                    // STOP clears the bus either way.
                    self.send_stop();
                }
                // The engine may still hold cursors into the caller's
                // buffers; scrub them before the borrow ends.
                critical_section::with(|cs| {
                    let mut state = self.state.borrow_ref_mut(cs);
                    state.msgv = core::ptr::null_mut();
                    state.ptr = core::ptr::null_mut();
                    state.msgc = 0;
                    state.progress = Progress::NextMessage;
                    state.check_addr_ack = false;
                });
                status
            }
        };

        let mut errval = wait.err();

        if status & u32::from(regs::SR1_ERRORMASK) != 0 {
            errval = Some(if status & u32::from(regs::SR1_BERR) != 0 {
                ResponseCode::BusError
            } else if status & u32::from(regs::SR1_ARLO) != 0 {
                ResponseCode::ArbitrationLost
            } else if status & u32::from(regs::SR1_AF) != 0 {
                ResponseCode::Nack
            } else if status & u32::from(regs::SR1_OVR) != 0 {
                ResponseCode::Overrun
            } else if status & u32::from(regs::SR1_PECERR) != 0 {
                ResponseCode::Protocol
            } else if status & u32::from(regs::SR1_TIMEOUT) != 0 {
                ResponseCode::BusTimeout
            } else {
                // SMBALERT: only possible with SMBus, which stays off.
                ResponseCode::Interrupted
            });
        } else if status & (u32::from(regs::SR2_BUSY) << 16) != 0 {
            // Not an error bit, but the bus never went quiet; typically
            // an unhealthy device holding a line.
            errval = Some(ResponseCode::Busy);
        }

        #[cfg(feature = "trace")]
        critical_section::with(|cs| self.state.borrow_ref(cs).trace.dump());

        #[cfg(feature = "fsmc-workaround")]
        {
            self.wait_stop();
            self.platform.post_transfer_hook(fsmc_token);
        }

        self.unlock();

        match errval {
            None => Ok(()),
            Some(code) => Err(code),
        }
    }
}

/// A caller handle on a bus: a target address plus per-handle settings.
/// Dropping the last handle tears the hardware down.
pub struct I2cDevice<'bus, R: Registers, P: Platform> {
    bus: &'bus I2cBus<R, P>,
    address: u16,
    flags: u16,
    frequency: u32,
}

impl<R: Registers, P: Platform> I2cDevice<'_, R, P> {
    /// Set the bus frequency used for this handle's transfers and return
    /// the value stored.  Peripheral clocks under 4 MHz cannot make fast
    /// mode, so the request is clamped to 100 kHz there.
    pub fn set_frequency(&mut self, frequency: u32) -> u32 {
        self.bus.lock();
        self.frequency = if self.bus.platform.pclk_hz() < 4_000_000 {
            100_000
        } else {
            frequency
        };
        self.bus.unlock();
        self.frequency
    }

    /// Set the target address.  `nbits` of 10 selects 10-bit addressing.
    pub fn set_address(&mut self, address: u16, nbits: u8) {
        self.bus.lock();
        self.address = address;
        self.flags = if nbits == 10 { FLAG_TEN } else { 0 };
        self.bus.unlock();
    }

    /// Send `buffer` to the current target.
    pub fn write(&mut self, buffer: &[u8]) -> Result<(), ResponseCode> {
        let mut msgs =
            [I2cMsg::write(self.address, buffer).with_flags(self.flags)];
        self.bus.process(&mut msgs, self.frequency)
    }

    /// Fill `buffer` from the current target.
    pub fn read(&mut self, buffer: &mut [u8]) -> Result<(), ResponseCode> {
        let mut msgs =
            [I2cMsg::read(self.address, buffer).with_flags(self.flags)];
        self.bus.process(&mut msgs, self.frequency)
    }

    /// Run an arbitrary message chain as one bus transaction.
    #[cfg(feature = "transfer")]
    pub fn transfer(
        &mut self,
        msgs: &mut [I2cMsg<'_>],
    ) -> Result<(), ResponseCode> {
        self.bus.process(msgs, self.frequency)
    }

    /// Bit-bang the bus back to life after a wedge.  See
    /// [`recovery`](RecoveryPins) for the pin contract.
    #[cfg(feature = "bus-recovery")]
    pub fn reset(
        &mut self,
        pins: &dyn RecoveryPins,
    ) -> Result<(), ResponseCode> {
        self.bus.reset(pins)
    }
}

impl<R: Registers, P: Platform> Drop for I2cDevice<'_, R, P> {
    fn drop(&mut self) {
        self.bus.release();
    }
}
