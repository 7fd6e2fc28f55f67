use std::{fs, io, ops::ControlFlow, path::Path};

use tracing::debug;

use super::{Engine, EngineLoader, EngineResult, LoadError, TokenCallback};

/// Deterministic stand-in engine: echoes the input word by word.
///
/// Tokens are `"word"` for the first and `" word"` afterwards, so that
/// concatenating a stream reproduces the one-shot completion. When loaded
/// from a resource whose first non-empty line is text, that line is emitted
/// as a leading token.
#[derive(Debug, Clone, Default)]
pub struct EchoEngine {
    prefix: Option<String>,
}

impl EchoEngine {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    fn tokens<'a>(&'a self, input: &'a str, budget: u32) -> impl Iterator<Item = String> + 'a {
        self.prefix
            .as_deref()
            .into_iter()
            .chain(input.split_whitespace())
            .enumerate()
            .map(|(index, word)| {
                if index == 0 {
                    word.to_string()
                } else {
                    format!(" {}", word)
                }
            })
            .take(budget as usize)
    }
}

impl Engine for EchoEngine {
    fn complete_once(&mut self, input: &str, budget: u32) -> EngineResult<String> {
        Ok(self.tokens(input, budget).collect())
    }

    fn stream_generate(
        &mut self,
        input: &str,
        budget: u32,
        on_token: &mut TokenCallback<'_>,
    ) -> EngineResult<()> {
        for token in self.tokens(input, budget) {
            if let ControlFlow::Break(()) = on_token(&token) {
                debug!("echo generation stopped early");
                break;
            }
        }
        Ok(())
    }
}

/// Loads an [`EchoEngine`] from any readable regular file.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoLoader;

impl EngineLoader for EchoLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn Engine>, LoadError> {
        let bytes = fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LoadError::NotFound(path.to_path_buf()),
            _ => LoadError::Rejected {
                path: path.to_path_buf(),
                reason: e.to_string(),
            },
        })?;
        let prefix = String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string);
        debug!(path = %path.display(), ?prefix, "echo engine loaded");
        Ok(Box::new(EchoEngine::new(prefix)))
    }
}
