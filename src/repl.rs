// File: src/repl.rs
//
// Interactive REPL for Coyote. The compiler is single-pass and has no
// notion of "add one more statement to an already-compiled chunk", so the
// REPL keeps the full session transcript and recompiles-and-reruns it from
// scratch on every accepted input, against a fresh VM each time. Earlier
// side effects (e.g. `print`) therefore replay along with the new
// statement — the same tradeoff every from-scratch, non-incremental
// compiler REPL makes. Compile/runtime errors are reported and the
// offending line is dropped from the transcript rather than aborting the
// session.

use colored::Colorize;
use coyote::{compiler::Compiler, natives_builtin, vm::Vm};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub struct Repl {
    transcript: String,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { transcript: String::new(), editor })
    }

    fn show_banner(&self) {
        println!("{}", "╔══════════════════════════════════════════════════════╗".bright_cyan());
        println!("{}", "║              Coyote REPL — interactive shell          ║".bright_cyan());
        println!("{}", "╚══════════════════════════════════════════════════════╝".bright_cyan());
        println!();
        println!(
            "  {} Use {}{}{}{}",
            "Welcome!".bright_green(),
            ":".bright_blue(),
            "help".bright_yellow(),
            " for commands or ".bright_blue(),
            ":quit".bright_yellow()
        );
        println!("  {} Multi-line input: end with unclosed braces", "Tip:".bright_magenta());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() {
                "coyote> ".bright_green().to_string()
            } else {
                "......> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        } else {
                            break;
                        }
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if is_input_complete(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (Ctrl+C to interrupt, :quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "\nGoodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {err}", "Error:".bright_red());
                    break;
                }
            }
        }

        Ok(())
    }

    /// Returns true to keep the REPL running, false to quit.
    fn handle_command(&mut self, cmd: &str) -> bool {
        match cmd {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" | ":exit" => {
                println!("{}", "Goodbye!".bright_cyan());
                false
            }
            ":clear" | ":c" => {
                print!("\x1B[2J\x1B[1;1H");
                self.show_banner();
                true
            }
            ":reset" | ":r" => {
                self.transcript.clear();
                println!("{}", "session reset".bright_green());
                true
            }
            _ => {
                println!(
                    "{} unknown command: {cmd}. Type {}{}{}",
                    "Error:".bright_red(),
                    ":".bright_blue(),
                    "help".bright_yellow(),
                    " for available commands.".bright_blue()
                );
                true
            }
        }
    }

    fn show_help(&self) {
        println!();
        println!("{}", "REPL commands:".bright_cyan().bold());
        println!("  {}{}  show this help message", ":help".bright_yellow(), " or :h    ".dimmed());
        println!("  {}{}  exit the REPL", ":quit".bright_yellow(), " or :q    ".dimmed());
        println!("  {}{}  clear the screen", ":clear".bright_yellow(), " or :c   ".dimmed());
        println!("  {}{}  forget the session transcript", ":reset".bright_yellow(), " or :r  ".dimmed());
        println!();
        println!("Leave braces, brackets, or parentheses unclosed to continue on the");
        println!("next line; close them to compile and run what you've typed so far.");
        println!();
    }

    /// Appends `input` to the transcript, recompiles and reruns the whole
    /// session. On failure the appended lines are rolled back so a typo
    /// doesn't permanently poison later attempts.
    fn eval_input(&mut self, input: &str) {
        if input.trim().is_empty() {
            return;
        }

        let candidate = format!("{}{}", self.transcript, input);
        let natives = natives_builtin::registry();
        let chunk = match Compiler::compile(&candidate, &natives) {
            Ok(chunk) => chunk,
            Err(errors) => {
                for err in &errors {
                    eprintln!("{} {err}", "Error:".bright_red());
                }
                return;
            }
        };

        let mut vm = Vm::new(natives);
        match vm.interpret(chunk) {
            Ok(()) => {
                self.transcript = candidate;
            }
            Err(e) => {
                eprintln!("{} {e}", "Error:".bright_red());
            }
        }
    }
}

/// True if every brace/bracket/paren opened in `input` has been closed and
/// no string literal is left open — the same bracket-tracking the scanner
/// itself does for newline significance (spec.md §4.1), reused here to
/// decide whether to keep reading more lines.
fn is_input_complete(input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return true;
    }

    let mut brace = 0i32;
    let mut bracket = 0i32;
    let mut paren = 0i32;
    let mut in_string = false;
    let mut in_line_comment = false;
    let mut chars = trimmed.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_line_comment {
            if ch == '\n' {
                in_line_comment = false;
            }
            continue;
        }
        if in_string {
            if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '/' if chars.peek() == Some(&'/') => in_line_comment = true,
            '{' => brace += 1,
            '}' => brace -= 1,
            '[' => bracket += 1,
            ']' => bracket -= 1,
            '(' => paren += 1,
            ')' => paren -= 1,
            _ => {}
        }
    }

    !in_string && brace <= 0 && bracket <= 0 && paren <= 0
}

impl Default for Repl {
    fn default() -> Self {
        Self::new().expect("failed to create REPL")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_input_is_complete() {
        assert!(is_input_complete("var x = 1"));
        assert!(is_input_complete("if x { print x }"));
    }

    #[test]
    fn unclosed_brace_is_incomplete() {
        assert!(!is_input_complete("if x {"));
        assert!(!is_input_complete("func f() int {\n return 1"));
    }

    #[test]
    fn string_braces_are_ignored() {
        assert!(is_input_complete(r#"print "{ not a brace }""#));
    }
}
