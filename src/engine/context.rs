//! Context frames
//!
//! Nested scopes contribute cwd/env/shell/timeout/target settings to
//! every command spawned through the view. Inner frames override outer
//! frames on key collisions; env contributions are additive.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::command::{Command, Shell, Target};

/// One scope's contribution to command defaults.
#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    pub cwd: Option<PathBuf>,
    /// Additive env; applied under any command-level env.
    pub env: BTreeMap<String, String>,
    pub shell: Option<Shell>,
    pub timeout: Option<Duration>,
    pub target: Option<Target>,
}

impl ContextConfig {
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn shell(mut self, shell: Shell) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }
}

/// Immutable stack of context frames; views clone it cheaply on push.
#[derive(Debug, Clone, Default)]
pub(crate) struct ContextStack {
    frames: Vec<ContextConfig>,
}

impl ContextStack {
    pub fn push(&self, frame: ContextConfig) -> Self {
        let mut frames = self.frames.clone();
        frames.push(frame);
        Self { frames }
    }

    /// Fold the stack into command defaults. The command wins on fields it
    /// sets; frames win innermost-first among themselves.
    pub fn apply(&self, cmd: &mut Command) {
        // Innermost frame first for single-value fields.
        for frame in self.frames.iter().rev() {
            if cmd.cwd.is_none() {
                cmd.cwd = frame.cwd.clone();
            }
            if cmd.timeout.is_none() {
                cmd.timeout = frame.timeout;
            }
            if matches!(cmd.target, Target::Auto) {
                if let Some(target) = &frame.target {
                    cmd.target = target.clone();
                }
            }
        }

        // Shell: a command that did not choose explicitly follows the
        // innermost frame that did.
        if cmd.shell == Shell::Default || (cmd.shell == Shell::Off && cmd.shell_line.is_none()) {
            for frame in self.frames.iter().rev() {
                if let Some(shell) = &frame.shell {
                    // A program/args command keeps Shell::Off semantics.
                    if cmd.shell_line.is_some() {
                        cmd.shell = shell.clone();
                    }
                    break;
                }
            }
        }

        // Env is additive: outer frames first so inner frames override.
        for frame in &self.frames {
            for (key, value) in &frame.env {
                cmd.env_extra.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inner_frame_overrides_outer() {
        let stack = ContextStack::default()
            .push(ContextConfig::default().cwd("/outer").env("LEVEL", "outer"))
            .push(ContextConfig::default().cwd("/inner").env("LEVEL", "inner"));

        let mut cmd = Command::new("pwd");
        stack.apply(&mut cmd);

        assert_eq!(cmd.cwd.as_deref(), Some(std::path::Path::new("/inner")));
        assert_eq!(cmd.env_extra.get("LEVEL").map(String::as_str), Some("inner"));
    }

    #[test]
    fn test_command_wins_over_context() {
        let stack =
            ContextStack::default().push(ContextConfig::default().cwd("/ctx").timeout(
                Duration::from_secs(5),
            ));

        let mut cmd = Command::new("pwd")
            .cwd("/explicit")
            .timeout(Duration::from_secs(1));
        stack.apply(&mut cmd);

        assert_eq!(cmd.cwd.as_deref(), Some(std::path::Path::new("/explicit")));
        assert_eq!(cmd.timeout, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_env_additive_across_frames() {
        let stack = ContextStack::default()
            .push(ContextConfig::default().env("A", "1"))
            .push(ContextConfig::default().env("B", "2"));

        let mut cmd = Command::new("env");
        stack.apply(&mut cmd);

        assert_eq!(cmd.env_extra.get("A").map(String::as_str), Some("1"));
        assert_eq!(cmd.env_extra.get("B").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_target_inherited_only_when_auto() {
        let stack = ContextStack::default()
            .push(ContextConfig::default().target(Target::Local));

        let mut auto_cmd = Command::new("ls");
        stack.apply(&mut auto_cmd);
        assert!(matches!(auto_cmd.target, Target::Local));

        let mut explicit = Command::new("ls").target(Target::Mock);
        stack.apply(&mut explicit);
        assert!(matches!(explicit.target, Target::Mock));
    }
}
