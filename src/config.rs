//! Environment-driven run configuration. Mirrors the variables named in the
//! scenario's external interface: `stcColor`, `stcTitle`, `stcDumpLogs`,
//! `stcHaltOnError`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Dark,
    Light,
    On,
    Off,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub color: ColorMode,
    pub title: Option<String>,
    pub dump_logs: bool,
    pub halt_on_error: bool,
}

impl RunConfig {
    pub fn from_env() -> Self {
        let color = match std::env::var("stcColor").as_deref() {
            Ok("dark") => ColorMode::Dark,
            Ok("light") => ColorMode::Light,
            Ok("true") => ColorMode::On,
            _ => ColorMode::Off,
        };
        let title = std::env::var("stcTitle").ok();
        let dump_logs = std::env::var("stcDumpLogs").as_deref() == Ok("true");
        let halt_on_error = std::env::var("stcHaltOnError").as_deref() == Ok("true");

        RunConfig {
            color,
            title,
            dump_logs,
            halt_on_error,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            color: ColorMode::Off,
            title: None,
            dump_logs: false,
            halt_on_error: false,
        }
    }
}
