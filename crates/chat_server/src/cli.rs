/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Command Line Interface
use once_cell::sync::Lazy;

/// The parsed command-line arguments provided to this program. Lazily initialized.
///
/// # Exits
///
/// Exits if [`argh::from_env`] would exit--for example, if the `--help` flag was provided or the
/// program arguments could not be parsed.
pub static PARSED_COMMANDS: Lazy<TopLevel> = Lazy::new(argh::from_env);

/// Toplevel CLI commands and options.
/// Subcommands are optional.
/// If no command is provided "serve" will be invoked with default options.
#[derive(argh::FromArgs, PartialEq, Debug)]
pub struct TopLevel {
    /// subcommands
    #[argh(subcommand)]
    pub subcommand: Option<Command>,
}

/// Subcommands
#[derive(argh::FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum Command {
    /// starts the server.
    Serve(Serve),

    /// runs pending SQL migrations against `DATABASE_URL` and exits.
    Migrate(Migrate),

    /// prints the version to stdout.
    Version(Version),
}

/// Starts the server. This is the default command when no command is provided.
#[derive(argh::FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "serve")]
pub struct Serve {
    /// overrides the `PORT` environment variable.
    #[argh(option, short = 'p')]
    pub port: Option<u16>,
}

impl Default for Serve {
    fn default() -> Serve {
        Serve { port: None }
    }
}

/// Runs pending SQL migrations and exits without starting the server.
#[derive(argh::FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "migrate")]
pub struct Migrate {}

/// Prints the version to stdout.
#[derive(argh::FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "version")]
pub struct Version {}

#[cfg(test)]
#[rustfmt::skip]
mod test {
    use super::*;
    use argh::FromArgs;

    #[test]
    fn version() {
        assert_eq!(
            TopLevel::from_args(&["chat_server"], &["version"]).expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Version(Version {}))
            }
        );
    }

    #[test]
    fn migrate() {
        assert_eq!(
            TopLevel::from_args(&["chat_server"], &["migrate"]).expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Migrate(Migrate {}))
            }
        );
    }

    #[test]
    fn serve_only() {
        assert_eq!(
            TopLevel::from_args(&["chat_server"], &["serve"]).expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Serve(Serve { port: None }))
            }
        );
    }

    #[test]
    fn serve_with_port() {
        assert_eq!(
            TopLevel::from_args(&["chat_server"], &["serve", "--port", "4000"])
                .expect("from_args failed"),
            TopLevel {
                subcommand: Some(Command::Serve(Serve { port: Some(4000) }))
            }
        );
    }

    #[test]
    fn no_subcommand_parses() {
        assert_eq!(
            TopLevel::from_args(&["chat_server"], &[]).expect("from_args failed"),
            TopLevel { subcommand: None }
        );
    }
}
