use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const PAUSE_ENV_VAR: &str = "LEADRUN_EXECUTION_PAUSED";

/// Global execution valve. Checked at the top of every job before storage is
/// touched.
pub trait PauseGate: Send + Sync {
    fn is_paused(&self) -> bool;
}

/// In-process switch. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct PauseSwitch {
    paused: Arc<AtomicBool>,
}

impl PauseSwitch {
    pub fn new(paused: bool) -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(paused)),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

impl PauseGate for PauseSwitch {
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Paused while the environment variable is exactly `"true"`. Read on every
/// check so operators can flip it without a restart.
#[derive(Debug, Clone)]
pub struct EnvPauseGate {
    var: String,
}

impl EnvPauseGate {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvPauseGate {
    fn default() -> Self {
        Self::new(PAUSE_ENV_VAR)
    }
}

impl PauseGate for EnvPauseGate {
    fn is_paused(&self) -> bool {
        matches!(std::env::var(&self.var), Ok(value) if value == "true")
    }
}

/// Paused while the flag file exists.
#[derive(Debug, Clone)]
pub struct FlagFilePauseGate {
    path: PathBuf,
}

impl FlagFilePauseGate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PauseGate for FlagFilePauseGate {
    fn is_paused(&self) -> bool {
        self.path.exists()
    }
}

/// Paused when any inner gate is paused.
#[derive(Default)]
pub struct AnyPauseGate {
    gates: Vec<Box<dyn PauseGate>>,
}

impl AnyPauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, gate: impl PauseGate + 'static) -> Self {
        self.gates.push(Box::new(gate));
        self
    }
}

impl PauseGate for AnyPauseGate {
    fn is_paused(&self) -> bool {
        self.gates.iter().any(|gate| gate.is_paused())
    }
}

#[cfg(test)]
mod tests {
    use super::{AnyPauseGate, EnvPauseGate, FlagFilePauseGate, PauseGate, PauseSwitch};

    #[test]
    fn switch_clones_share_state() {
        let switch = PauseSwitch::default();
        let observer = switch.clone();
        assert!(!observer.is_paused());
        switch.pause();
        assert!(observer.is_paused());
        switch.resume();
        assert!(!observer.is_paused());
    }

    #[test]
    fn env_gate_requires_exact_true() {
        let gate = EnvPauseGate::new("LEADRUN_TEST_PAUSE_EXACT");
        std::env::remove_var("LEADRUN_TEST_PAUSE_EXACT");
        assert!(!gate.is_paused());
        std::env::set_var("LEADRUN_TEST_PAUSE_EXACT", "TRUE");
        assert!(!gate.is_paused());
        std::env::set_var("LEADRUN_TEST_PAUSE_EXACT", "true");
        assert!(gate.is_paused());
        std::env::remove_var("LEADRUN_TEST_PAUSE_EXACT");
    }

    #[test]
    fn flag_file_gate_follows_file_presence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let flag = dir.path().join("paused");
        let gate = FlagFilePauseGate::new(&flag);
        assert!(!gate.is_paused());
        std::fs::write(&flag, b"").expect("write flag");
        assert!(gate.is_paused());
    }

    #[test]
    fn any_gate_pauses_when_one_inner_gate_does() {
        let switch = PauseSwitch::default();
        let gate = AnyPauseGate::new()
            .with(EnvPauseGate::new("LEADRUN_TEST_PAUSE_ANY_UNSET"))
            .with(switch.clone());
        assert!(!gate.is_paused());
        switch.pause();
        assert!(gate.is_paused());
    }
}
