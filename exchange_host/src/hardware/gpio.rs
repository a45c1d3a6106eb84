//! Hardware capabilities for the bill path.
//!
//! Motor drivers, IR sensors and LEDs live behind these traits; the real
//! GPIO backend is wired in by the binary, and the recording mocks double
//! as the degraded boot mode when no hardware responds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

/// A DC motor on a forward/backward pair with an enable line.
///
/// `set_speed` drives the enable line; implementations without PWM treat
/// any positive speed as full on.
pub trait Motor: Send {
    fn forward(&mut self);
    fn backward(&mut self);
    fn stop(&mut self);
    fn set_speed(&mut self, speed: f32);
}

/// An IR break-beam sensor. `detecting` is `true` when the beam is broken
/// (a bill is present); the active-low electrical level is the
/// implementation's concern.
pub trait IrSensor: Send {
    fn detecting(&self) -> bool;
}

/// A single active-high LED output.
pub trait Led: Send {
    fn on(&mut self);
    fn off(&mut self);
}

/// Scope guard for an energized motor.
///
/// The motor is stopped when the guard drops, so every exit path out of a
/// dispense or feed sequence leaves the mechanism de-energized.
pub struct MotorGuard<'a> {
    motor: &'a mut dyn Motor,
}

impl<'a> MotorGuard<'a> {
    pub fn forward(motor: &'a mut dyn Motor, speed: f32) -> Self {
        motor.set_speed(speed);
        motor.forward();
        MotorGuard { motor }
    }

    pub fn backward(motor: &'a mut dyn Motor, speed: f32) -> Self {
        motor.set_speed(speed);
        motor.backward();
        MotorGuard { motor }
    }
}

impl Drop for MotorGuard<'_> {
    fn drop(&mut self) {
        self.motor.stop();
    }
}

/// Call log shared between a [`MockMotor`] and the test observing it.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MotorLog {
    pub forward: u32,
    pub backward: u32,
    pub stop: u32,
    pub last_speed: f32,
}

/// Recording motor used in tests and in degraded boot mode.
#[derive(Debug, Default)]
pub struct MockMotor {
    log: Arc<Mutex<MotorLog>>,
}

impl MockMotor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn log_handle(&self) -> Arc<Mutex<MotorLog>> {
        Arc::clone(&self.log)
    }
}

impl Motor for MockMotor {
    fn forward(&mut self) {
        trace!("mock motor forward");
        self.log.lock().expect("should not be poisoned").forward += 1;
    }

    fn backward(&mut self) {
        trace!("mock motor backward");
        self.log.lock().expect("should not be poisoned").backward += 1;
    }

    fn stop(&mut self) {
        trace!("mock motor stop");
        self.log.lock().expect("should not be poisoned").stop += 1;
    }

    fn set_speed(&mut self, speed: f32) {
        self.log.lock().expect("should not be poisoned").last_speed = speed;
    }
}

/// IR sensor fed from a script of readings.
///
/// Reads consume the script front to back; once exhausted every read
/// returns the fallback value. The number of `true` readings handed out is
/// tracked so tests can assert how many bills the sensor saw.
#[derive(Debug, Default)]
pub struct ScriptedIr {
    script: Arc<Mutex<VecDeque<bool>>>,
    fallback: bool,
    detections: Arc<AtomicU32>,
}

impl ScriptedIr {
    #[must_use]
    pub fn always(value: bool) -> Self {
        ScriptedIr {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: value,
            detections: Arc::new(AtomicU32::new(0)),
        }
    }

    #[must_use]
    pub fn script(reads: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        ScriptedIr {
            script: Arc::new(Mutex::new(reads.into_iter().collect())),
            fallback,
            detections: Arc::new(AtomicU32::new(0)),
        }
    }

    #[must_use]
    pub fn detection_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.detections)
    }
}

impl IrSensor for ScriptedIr {
    fn detecting(&self) -> bool {
        let value = self
            .script
            .lock()
            .expect("should not be poisoned")
            .pop_front()
            .unwrap_or(self.fallback);
        if value {
            self.detections.fetch_add(1, Ordering::Relaxed);
        }
        value
    }
}

/// Recording LED used in tests and in degraded boot mode.
#[derive(Debug, Default)]
pub struct MockLed {
    lit: Arc<Mutex<bool>>,
    toggles: Arc<AtomicU32>,
}

impl MockLed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn toggle_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.toggles)
    }
}

impl Led for MockLed {
    fn on(&mut self) {
        *self.lit.lock().expect("should not be poisoned") = true;
        self.toggles.fetch_add(1, Ordering::Relaxed);
    }

    fn off(&mut self) {
        *self.lit.lock().expect("should not be poisoned") = false;
    }
}
