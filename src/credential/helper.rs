//! Interactive token helper (`cai-mcp token`)
//!
//! Shows the saved token or walks the user through copying one out of the
//! browser, then persists it next to the project.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use tracing::info;

use super::{CredentialSource, Token};

const INSTRUCTIONS: &str = "\
No Character.AI token saved yet. To get one:

  1. Open https://character.ai in your browser and log in.
  2. Open the developer tools (F12) and switch to the Network tab.
  3. Reload the page and pick any request to neo.character.ai or plus.character.ai.
  4. Copy the value of the `Authorization` request header (`Token <value>`).
     Alternatively: Application/Storage tab > Local Storage > character.ai > `char_token`.

Quotes and a leading `Token ` are removed automatically.
";

/// How the helper finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperOutcome {
    /// A new token was written
    Saved,
    /// A token was already present and left unchanged
    Kept,
    /// First-time setup without any input
    Missing,
}

impl HelperOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            HelperOutcome::Saved | HelperOutcome::Kept => 0,
            HelperOutcome::Missing => 1,
        }
    }
}

/// Run the helper against arbitrary input/output streams
pub fn run<R: BufRead, W: Write>(
    source: &CredentialSource,
    reveal: bool,
    input: &mut R,
    output: &mut W,
) -> Result<HelperOutcome> {
    match source.saved()? {
        Some(existing) => {
            let shown = if reveal {
                existing.as_str().to_string()
            } else {
                existing.masked()
            };
            writeln!(output, "Saved token ({}): {}", source.path().display(), shown)?;
            write!(output, "Paste a new token to replace it (leave empty to keep): ")?;
            output.flush()?;

            match read_token(input)? {
                Some(token) if token != existing => {
                    source.save(&token)?;
                    info!("Replaced saved token");
                    writeln!(output, "✓ Token updated")?;
                    Ok(HelperOutcome::Saved)
                }
                _ => {
                    writeln!(output, "Keeping existing token")?;
                    Ok(HelperOutcome::Kept)
                }
            }
        }
        None => {
            writeln!(output, "{}", INSTRUCTIONS)?;
            write!(output, "Token: ")?;
            output.flush()?;

            match read_token(input)? {
                Some(token) => {
                    source.save(&token)?;
                    info!("Saved new token");
                    writeln!(output, "✓ Token saved to {}", source.path().display())?;
                    writeln!(output, "  ${} takes precedence over the file when set", source.env_var())?;
                    Ok(HelperOutcome::Saved)
                }
                None => {
                    writeln!(output, "No token provided")?;
                    Ok(HelperOutcome::Missing)
                }
            }
        }
    }
}

fn read_token<R: BufRead>(input: &mut R) -> Result<Option<Token>> {
    let mut line = String::new();
    input.read_line(&mut line).context("Failed to read token from stdin")?;
    Ok(Token::parse(&line))
}
