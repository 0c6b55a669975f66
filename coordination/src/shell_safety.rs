//! Shell Safety: command allow-list and argument validation
//!
//! Every command the pipeline executes on behalf of a model passes through
//! [`CommandPolicy::check`] before a process is spawned. Commands run without a
//! shell (`Command::new(program).args(..)`), so metacharacters are inert; they
//! are rejected anyway so a model cannot smuggle chaining into a sandbox that
//! does wrap commands in `sh -c`.

use crate::error::{CoordinationError, CoordinationResult};

/// Programs the execution interface may run: test runner, interpreter,
/// linter, formatter, package installer.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &["pytest", "python", "pylint", "black", "pip"];

/// Subset of metacharacters that indicate chaining/injection intent
/// (vs. globbing characters that might appear in legitimate args).
const INJECTION_CHARACTERS: &[char] = &[';', '|', '&', '`', '$', '(', ')', '\n', '\r'];

/// Validation error for argument checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgValidationError {
    /// The problematic character found.
    pub character: char,
    /// Position in the input string (in chars).
    pub position: usize,
    /// The original input (truncated to 100 chars).
    pub input_preview: String,
}

impl std::fmt::Display for ArgValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dangerous character '{}' at position {} in: {}",
            self.character.escape_default(),
            self.position,
            self.input_preview
        )
    }
}

impl std::error::Error for ArgValidationError {}

/// Validate that an argument contains no injection-class metacharacters.
pub fn validate_arg(arg: &str) -> Result<(), ArgValidationError> {
    for (pos, ch) in arg.chars().enumerate() {
        if INJECTION_CHARACTERS.contains(&ch) {
            let input_preview = if arg.chars().count() > 100 {
                format!("{}...", arg.chars().take(100).collect::<String>())
            } else {
                arg.to_string()
            };
            return Err(ArgValidationError {
                character: ch,
                position: pos,
                input_preview,
            });
        }
    }
    Ok(())
}

/// Sanitize a string for use as a container name or file-name component.
///
/// Replaces any character that is not alphanumeric, `-`, `_`, or `.` with `_`.
pub fn sanitize_identifier(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Allow-list of executable programs.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed: Vec<String>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_COMMANDS.iter().map(|s| s.to_string()))
    }
}

impl CommandPolicy {
    pub fn new(allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    pub fn is_allowed(&self, program: &str) -> bool {
        self.allowed.iter().any(|a| a == program)
    }

    /// Check an already-tokenized command line.
    ///
    /// The program must be a bare allow-listed name (no path), interpreters
    /// may not run inline code, and no argument may carry injection
    /// characters.
    pub fn check(&self, argv: &[String]) -> CoordinationResult<()> {
        let Some(program) = argv.first() else {
            return Err(CoordinationError::CommandNotAllowed {
                command: String::new(),
            });
        };

        if !self.is_allowed(program) {
            return Err(CoordinationError::CommandNotAllowed {
                command: program.clone(),
            });
        }

        if program == "python" && argv.iter().skip(1).any(|a| a == "-c") {
            return Err(CoordinationError::CommandRejected {
                command: argv.join(" "),
                reason: "inline interpreter code is not allowed".into(),
            });
        }

        for arg in argv {
            validate_arg(arg).map_err(|e| CoordinationError::CommandRejected {
                command: argv.join(" "),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }
}
