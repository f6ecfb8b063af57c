//! REPLコマンド

use crate::parse::{parse_address, parse_flags};
use crate::trace::{ListOptions, ProfileOptions};
use thiserror::Error;

/// REPLコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// スレッドとスタックの一覧（`info tsos [-r] [-c]`）
    InfoTsos(ListOptions),
    /// 実行中スレッドのプロファイル行（`info tsoprofile [-v] [-u]`）
    InfoTsoProfile(ProfileOptions),
    /// シンボル検索
    Find(String),
    /// アドレスの関数名
    Name(u64),
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

/// コマンドのパースエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Unknown option '{option}' for '{command}'")]
    UnknownOption { command: &'static str, option: String },

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("{0}")]
    InvalidAddress(String),
}

impl Command {
    /// コマンド文字列をパースする
    ///
    /// 空行は`Ok(None)`。
    pub fn parse(input: &str) -> Result<Option<Self>, CommandError> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let Some((&head, args)) = parts.split_first() else {
            return Ok(None);
        };

        let command = match head {
            "info" | "i" => match args.split_first() {
                Some((&"tsos", flags)) => {
                    let flags = parse_flags(flags, &['r', 'c']).map_err(|option| {
                        CommandError::UnknownOption {
                            command: "info tsos",
                            option: option.to_string(),
                        }
                    })?;
                    Command::InfoTsos(ListOptions {
                        running_only: flags.contains(&'r'),
                        compact: flags.contains(&'c'),
                    })
                }
                Some((&"tsoprofile", flags)) => {
                    let flags = parse_flags(flags, &['v', 'u']).map_err(|option| {
                        CommandError::UnknownOption {
                            command: "info tsoprofile",
                            option: option.to_string(),
                        }
                    })?;
                    Command::InfoTsoProfile(ProfileOptions {
                        verbose: flags.contains(&'v'),
                        unique: flags.contains(&'u'),
                    })
                }
                _ => return Err(CommandError::Usage("info tsos [-r] [-c] | info tsoprofile [-v] [-u]")),
            },
            "find" => {
                if args.is_empty() {
                    return Err(CommandError::Usage("find <pattern>"));
                }
                Command::Find(args.join(" "))
            }
            "name" => match args {
                [addr] => Command::Name(
                    parse_address(addr).map_err(|e| CommandError::InvalidAddress(e.to_string()))?,
                ),
                _ => return Err(CommandError::Usage("name <address>")),
            },
            "help" | "h" | "?" => Command::Help,
            "quit" | "q" | "exit" => Command::Quit,
            _ => return Err(CommandError::Unknown(input.trim().to_string())),
        };
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse(""), Ok(None));
        assert_eq!(Command::parse("  quit "), Ok(Some(Command::Quit)));
        assert_eq!(Command::parse("help"), Ok(Some(Command::Help)));
        assert_eq!(
            Command::parse("find Main_main"),
            Ok(Some(Command::Find("Main_main".to_string())))
        );
        assert_eq!(Command::parse("name 0x4a1f20"), Ok(Some(Command::Name(0x4a1f20))));
    }

    #[test]
    fn test_parse_info_tsos() {
        assert_eq!(
            Command::parse("info tsos"),
            Ok(Some(Command::InfoTsos(ListOptions::default())))
        );
        assert_eq!(
            Command::parse("info tsos -r -c"),
            Ok(Some(Command::InfoTsos(ListOptions {
                running_only: true,
                compact: true,
            })))
        );
        assert_eq!(
            Command::parse("info tsos -c"),
            Ok(Some(Command::InfoTsos(ListOptions {
                running_only: false,
                compact: true,
            })))
        );
    }

    #[test]
    fn test_parse_info_tsoprofile() {
        assert_eq!(
            Command::parse("info tsoprofile -vu"),
            Ok(Some(Command::InfoTsoProfile(ProfileOptions {
                verbose: true,
                unique: true,
            })))
        );
        assert_eq!(
            Command::parse("info tsoprofile -u"),
            Ok(Some(Command::InfoTsoProfile(ProfileOptions {
                verbose: false,
                unique: true,
            })))
        );
    }

    #[test]
    fn test_unknown_options_rejected() {
        assert_eq!(
            Command::parse("info tsos -v"),
            Err(CommandError::UnknownOption {
                command: "info tsos",
                option: "-v".to_string(),
            })
        );
        assert!(matches!(
            Command::parse("info tsoprofile -r"),
            Err(CommandError::UnknownOption { .. })
        ));
        assert!(matches!(Command::parse("info threads"), Err(CommandError::Usage(_))));
    }

    #[test]
    fn test_bad_arguments() {
        assert_eq!(Command::parse("find"), Err(CommandError::Usage("find <pattern>")));
        assert_eq!(Command::parse("name"), Err(CommandError::Usage("name <address>")));
        assert!(matches!(Command::parse("name zz"), Err(CommandError::InvalidAddress(_))));
        assert_eq!(
            Command::parse("continue"),
            Err(CommandError::Unknown("continue".to_string()))
        );
    }
}
