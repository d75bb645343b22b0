//! Process-wide switches read by the compiler.

use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use jinx_conf::MacroDebugging;
use jinx_conf::Settings;

static MACRO_DEBUGGING: AtomicU8 = AtomicU8::new(0);

pub fn set_macro_debugging(level: MacroDebugging) {
    let raw = match level {
        MacroDebugging::Off => 0,
        MacroDebugging::Inject => 1,
        MacroDebugging::Write => 2,
    };
    MACRO_DEBUGGING.store(raw, Ordering::Relaxed);
}

#[must_use]
pub fn macro_debugging() -> MacroDebugging {
    match MACRO_DEBUGGING.load(Ordering::Relaxed) {
        1 => MacroDebugging::Inject,
        2 => MacroDebugging::Write,
        _ => MacroDebugging::Off,
    }
}

/// Apply loaded settings to the process-wide flags.
pub fn init(settings: &Settings) {
    set_macro_debugging(settings.macro_debugging);
}
