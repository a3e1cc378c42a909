//! Job definition files.
//!
//! A job class is described by a line-oriented `<name>.conf` file of
//! stanzas. Parsing is all-or-nothing: any error rejects the file
//! wholesale (with line and token position) and the previously installed
//! class, if any, is left untouched.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::sys::signal::Signal;
use tracing::warn;

use crate::error::{DaemonError, ParseError};
use crate::expr::{self, Token};
use crate::job_class::{
    ApparmorPolicy, CgroupSpec, ConsoleType, ExpectType, JobClass, LimitValue,
    RlimitResource, RlimitSpec,
};
use crate::paths::CONF_EXT;
use crate::process::{ProcessRole, ProcessSpec};

/// Splits one configuration line into tokens; `#` at a token boundary
/// starts a comment and double quotes group.
fn tokenize_line(line: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_quotes = false;

    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' => in_quotes = false,
                '\\' if matches!(chars.peek(), Some('"') | Some('\\')) => {
                    current.push(chars.next().expect("peeked"));
                }
                other => current.push(other),
            }
            continue;
        }
        match ch {
            '"' => {
                in_quotes = true;
                quoted = true;
            }
            '#' if current.is_empty() && !quoted => break,
            c if c.is_whitespace() => {
                if !current.is_empty() || quoted {
                    tokens.push(Token {
                        text: std::mem::take(&mut current),
                        quoted,
                    });
                    quoted = false;
                }
            }
            other => current.push(other),
        }
    }
    if !current.is_empty() || quoted {
        tokens.push(Token {
            text: current,
            quoted,
        });
    }
    tokens
}

/// The raw text of `line` after its first `keywords` words, preserving
/// quoting and spacing; used for `exec` command bodies.
fn remainder_after(line: &str, keywords: usize) -> String {
    let mut rest = line.trim_start();
    for _ in 0..keywords {
        match rest.find(char::is_whitespace) {
            Some(idx) => rest = rest[idx..].trim_start(),
            None => return String::new(),
        }
    }
    rest.trim_end().to_string()
}

fn parse_signal(text: &str, lineno: usize) -> Result<i32, ParseError> {
    if let Ok(number) = text.parse::<i32>() {
        if (1..64).contains(&number) {
            return Ok(number);
        }
    } else {
        let name = if text.starts_with("SIG") {
            text.to_string()
        } else {
            format!("SIG{text}")
        };
        if let Ok(signal) = Signal::from_str(&name) {
            return Ok(signal as i32);
        }
    }
    Err(ParseError::IllegalValue {
        lineno,
        what: "signal",
        value: text.to_string(),
    })
}

fn parse_limit_value(text: &str, lineno: usize) -> Result<LimitValue, ParseError> {
    if text == "unlimited" {
        return Ok(LimitValue::Unlimited);
    }
    text.parse::<u64>()
        .map(LimitValue::Fixed)
        .map_err(|_| ParseError::IllegalValue {
            lineno,
            what: "limit",
            value: text.to_string(),
        })
}

/// Maps a legacy `oom N` adjustment (-17..15, `never`) onto the
/// oom_score_adj scale.
fn oom_adj_to_score(adj: i32) -> i32 {
    if adj < 0 {
        adj * 1000 / 17
    } else {
        adj * 1000 / 15
    }
}

struct FileParser<'a> {
    lines: Vec<&'a str>,
    index: usize,
}

impl<'a> FileParser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            lines: source.lines().collect(),
            index: 0,
        }
    }

    fn next_line(&mut self) -> Option<(usize, &'a str)> {
        while self.index < self.lines.len() {
            let lineno = self.index + 1;
            let line = self.lines[self.index];
            self.index += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            return Some((lineno, line));
        }
        None
    }

    /// Collects a `script` body up to its matching `end script` line.
    fn script_block(&mut self, opened_at: usize) -> Result<String, ParseError> {
        let mut body = String::new();
        while self.index < self.lines.len() {
            let line = self.lines[self.index];
            self.index += 1;
            if line.trim() == "end script" {
                return Ok(body);
            }
            body.push_str(line);
            body.push('\n');
        }
        Err(ParseError::UnterminatedScript { lineno: opened_at })
    }
}

fn single_arg(
    tokens: &[Token],
    lineno: usize,
    stanza: &'static str,
) -> Result<String, ParseError> {
    tokens
        .get(1)
        .map(|token| token.text.clone())
        .ok_or(ParseError::ExpectedArgument { lineno, stanza })
}

/// Parses one job definition file into a class named after the file stem.
pub fn parse_job(
    name: &str,
    source: &str,
    default_console: ConsoleType,
) -> Result<JobClass, ParseError> {
    let mut class = JobClass::new(name);
    class.console = default_console;

    let mut parser = FileParser::new(source);
    while let Some((lineno, line)) = parser.next_line() {
        let tokens = tokenize_line(line);
        let Some(first) = tokens.first() else {
            continue;
        };

        match first.text.as_str() {
            "instance" => class.instance = single_arg(&tokens, lineno, "instance")?,
            "description" => {
                class.description = Some(single_arg(&tokens, lineno, "description")?);
            }
            "author" => class.author = Some(single_arg(&tokens, lineno, "author")?),
            "version" => class.version = Some(single_arg(&tokens, lineno, "version")?),
            "usage" => class.usage = Some(single_arg(&tokens, lineno, "usage")?),
            "env" => {
                let entry = single_arg(&tokens, lineno, "env")?;
                crate::environ::set(&mut class.env, &entry);
            }
            "export" => {
                if tokens.len() < 2 {
                    return Err(ParseError::ExpectedArgument {
                        lineno,
                        stanza: "export",
                    });
                }
                class
                    .export
                    .extend(tokens[1..].iter().map(|t| t.text.clone()));
            }
            "start" => {
                expect_keyword(&tokens, 1, "on", lineno)?;
                class.start_on = Some(expr::parse(&tokens[2..], lineno)?);
            }
            "stop" => {
                expect_keyword(&tokens, 1, "on", lineno)?;
                class.stop_on = Some(expr::parse(&tokens[2..], lineno)?);
            }
            "manual" => class.start_on = None,
            "emits" => {
                if tokens.len() < 2 {
                    return Err(ParseError::ExpectedArgument {
                        lineno,
                        stanza: "emits",
                    });
                }
                class
                    .emits
                    .extend(tokens[1..].iter().map(|t| t.text.clone()));
            }
            "exec" => {
                let command = remainder_after(line, 1);
                if command.is_empty() {
                    return Err(ParseError::ExpectedArgument {
                        lineno,
                        stanza: "exec",
                    });
                }
                class
                    .processes
                    .insert(ProcessRole::Main, ProcessSpec::new(false, command));
            }
            "script" => {
                let body = parser.script_block(lineno)?;
                class
                    .processes
                    .insert(ProcessRole::Main, ProcessSpec::new(true, body));
            }
            "pre-start" | "post-start" | "pre-stop" | "post-stop" => {
                let role = match first.text.as_str() {
                    "pre-start" => ProcessRole::PreStart,
                    "post-start" => ProcessRole::PostStart,
                    "pre-stop" => ProcessRole::PreStop,
                    _ => ProcessRole::PostStop,
                };
                let kind = tokens.get(1).map(|t| t.text.as_str());
                match kind {
                    Some("exec") => {
                        let command = remainder_after(line, 2);
                        if command.is_empty() {
                            return Err(ParseError::ExpectedArgument {
                                lineno,
                                stanza: "exec",
                            });
                        }
                        class
                            .processes
                            .insert(role, ProcessSpec::new(false, command));
                    }
                    Some("script") => {
                        let body = parser.script_block(lineno)?;
                        class.processes.insert(role, ProcessSpec::new(true, body));
                    }
                    _ => {
                        return Err(ParseError::UnexpectedToken {
                            lineno,
                            pos: 1,
                            token: kind.unwrap_or("").to_string(),
                        });
                    }
                }
            }
            "expect" => {
                let value = single_arg(&tokens, lineno, "expect")?;
                class.expect =
                    ExpectType::from_str(&value).map_err(|_| ParseError::IllegalValue {
                        lineno,
                        what: "expect",
                        value,
                    })?;
            }
            "task" => class.task = true,
            "kill" => match tokens.get(1).map(|t| t.text.as_str()) {
                Some("timeout") => {
                    let value = tokens.get(2).map(|t| t.text.as_str()).unwrap_or("");
                    class.kill_timeout =
                        value.parse().map_err(|_| ParseError::IllegalValue {
                            lineno,
                            what: "interval",
                            value: value.to_string(),
                        })?;
                }
                Some("signal") => {
                    let value = single_arg(&tokens[1..], lineno, "kill signal")?;
                    class.kill_signal = parse_signal(&value, lineno)?;
                }
                other => {
                    return Err(ParseError::UnexpectedToken {
                        lineno,
                        pos: 1,
                        token: other.unwrap_or("").to_string(),
                    });
                }
            },
            "reload" => {
                expect_keyword(&tokens, 1, "signal", lineno)?;
                let value = single_arg(&tokens[1..], lineno, "reload signal")?;
                class.reload_signal = parse_signal(&value, lineno)?;
            }
            "respawn" => {
                if let Some(second) = tokens.get(1) {
                    if second.text != "limit" {
                        return Err(ParseError::UnexpectedToken {
                            lineno,
                            pos: 1,
                            token: second.text.clone(),
                        });
                    }
                    match tokens.get(2).map(|t| t.text.as_str()) {
                        Some("unlimited") => {
                            class.respawn_limit = 0;
                            class.respawn_interval = 0;
                        }
                        Some(limit) => {
                            let interval =
                                tokens.get(3).map(|t| t.text.as_str()).unwrap_or("");
                            class.respawn_limit =
                                limit.parse().map_err(|_| ParseError::IllegalValue {
                                    lineno,
                                    what: "limit",
                                    value: limit.to_string(),
                                })?;
                            class.respawn_interval = interval.parse().map_err(|_| {
                                ParseError::IllegalValue {
                                    lineno,
                                    what: "interval",
                                    value: interval.to_string(),
                                }
                            })?;
                        }
                        None => {
                            return Err(ParseError::ExpectedArgument {
                                lineno,
                                stanza: "respawn limit",
                            });
                        }
                    }
                } else {
                    class.respawn = true;
                }
            }
            "normal" => {
                expect_keyword(&tokens, 1, "exit", lineno)?;
                if tokens.len() < 3 {
                    return Err(ParseError::ExpectedArgument {
                        lineno,
                        stanza: "normal exit",
                    });
                }
                for token in &tokens[2..] {
                    if let Ok(code) = token.text.parse::<i32>() {
                        class.normalexit.push(code);
                    } else {
                        let signal = parse_signal(&token.text, lineno).map_err(|_| {
                            ParseError::IllegalValue {
                                lineno,
                                what: "exit status",
                                value: token.text.clone(),
                            }
                        })?;
                        class.normalexit.push(signal << 8);
                    }
                }
            }
            "console" => {
                let value = single_arg(&tokens, lineno, "console")?;
                class.console = ConsoleType::from_str(&value).map_err(|_| {
                    ParseError::IllegalValue {
                        lineno,
                        what: "console",
                        value,
                    }
                })?;
            }
            "umask" => {
                let value = single_arg(&tokens, lineno, "umask")?;
                class.umask = u32::from_str_radix(&value, 8)
                    .ok()
                    .filter(|mask| *mask <= 0o777)
                    .ok_or(ParseError::IllegalValue {
                        lineno,
                        what: "umask",
                        value,
                    })?;
            }
            "nice" => {
                let value = single_arg(&tokens, lineno, "nice")?;
                class.nice = Some(
                    value
                        .parse::<i32>()
                        .ok()
                        .filter(|nice| (-20..=19).contains(nice))
                        .ok_or(ParseError::IllegalValue {
                            lineno,
                            what: "nice",
                            value,
                        })?,
                );
            }
            "oom" => {
                let (value, legacy) = match tokens.get(1).map(|t| t.text.as_str()) {
                    Some("score") => {
                        (single_arg(&tokens[1..], lineno, "oom score")?, false)
                    }
                    Some(_) => (single_arg(&tokens, lineno, "oom")?, true),
                    None => {
                        return Err(ParseError::ExpectedArgument {
                            lineno,
                            stanza: "oom",
                        });
                    }
                };
                let score = if value == "never" {
                    -1000
                } else if legacy {
                    let adj = value
                        .parse::<i32>()
                        .ok()
                        .filter(|adj| (-17..=15).contains(adj))
                        .ok_or(ParseError::IllegalValue {
                            lineno,
                            what: "oom",
                            value: value.clone(),
                        })?;
                    oom_adj_to_score(adj)
                } else {
                    value
                        .parse::<i32>()
                        .ok()
                        .filter(|score| (-1000..=1000).contains(score))
                        .ok_or(ParseError::IllegalValue {
                            lineno,
                            what: "oom score",
                            value: value.clone(),
                        })?
                };
                class.oom_score_adj = Some(score);
            }
            "limit" => {
                if tokens.len() != 4 {
                    return Err(ParseError::ExpectedArgument {
                        lineno,
                        stanza: "limit",
                    });
                }
                let resource = RlimitResource::from_str(&tokens[1].text).map_err(|_| {
                    ParseError::IllegalValue {
                        lineno,
                        what: "limit resource",
                        value: tokens[1].text.clone(),
                    }
                })?;
                let soft = parse_limit_value(&tokens[2].text, lineno)?;
                let hard = parse_limit_value(&tokens[3].text, lineno)?;
                class.limits.insert(resource, RlimitSpec { soft, hard });
            }
            "chroot" => class.chroot = Some(single_arg(&tokens, lineno, "chroot")?),
            "chdir" => class.chdir = Some(single_arg(&tokens, lineno, "chdir")?),
            "setuid" => class.setuid = Some(single_arg(&tokens, lineno, "setuid")?),
            "setgid" => class.setgid = Some(single_arg(&tokens, lineno, "setgid")?),
            "apparmor" => match tokens.get(1).map(|t| t.text.as_str()) {
                Some("load") => {
                    let path = single_arg(&tokens[1..], lineno, "apparmor load")?;
                    class.apparmor = Some(ApparmorPolicy::Load(path));
                }
                Some("switch") => {
                    let profile = single_arg(&tokens[1..], lineno, "apparmor switch")?;
                    class.apparmor = Some(ApparmorPolicy::Switch(profile));
                }
                other => {
                    return Err(ParseError::UnexpectedToken {
                        lineno,
                        pos: 1,
                        token: other.unwrap_or("").to_string(),
                    });
                }
            },
            "cgroup" => {
                let controller = single_arg(&tokens, lineno, "cgroup")?;
                let name = tokens.get(2).map(|t| t.text.clone());
                let setting = match (tokens.get(3), tokens.get(4)) {
                    (Some(key), Some(value)) => {
                        Some((key.text.clone(), value.text.clone()))
                    }
                    (Some(_), None) => {
                        return Err(ParseError::ExpectedArgument {
                            lineno,
                            stanza: "cgroup",
                        });
                    }
                    _ => None,
                };
                let existing = class
                    .cgroups
                    .iter_mut()
                    .find(|c| c.controller == controller && c.name == name);
                match existing {
                    Some(spec) => {
                        if let Some(pair) = setting {
                            spec.settings.push(pair);
                        }
                    }
                    None => class.cgroups.push(CgroupSpec {
                        controller,
                        name,
                        settings: setting.into_iter().collect(),
                    }),
                }
            }
            "debug" => class.debug = true,
            other => {
                return Err(ParseError::UnknownStanza {
                    lineno,
                    stanza: other.to_string(),
                });
            }
        }
    }

    Ok(class)
}

fn expect_keyword(
    tokens: &[Token],
    index: usize,
    keyword: &'static str,
    lineno: usize,
) -> Result<(), ParseError> {
    match tokens.get(index) {
        Some(token) if token.text == keyword && !token.quoted => Ok(()),
        Some(token) => Err(ParseError::UnexpectedToken {
            lineno,
            pos: index,
            token: token.text.clone(),
        }),
        None => Err(ParseError::UnexpectedToken {
            lineno,
            pos: index,
            token: String::new(),
        }),
    }
}

/// Parses one `<name>.conf` file.
pub fn parse_job_file(
    path: &Path,
    default_console: ConsoleType,
) -> Result<JobClass, DaemonError> {
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let source = fs::read_to_string(path)?;
    Ok(parse_job(&name, &source, default_console)?)
}

/// Loads every job definition under `dir`.
///
/// Files that fail to parse are reported and skipped; the rest of the
/// directory still loads.
pub fn load_job_dir(
    dir: &Path,
    default_console: ConsoleType,
) -> (Vec<JobClass>, Vec<(PathBuf, DaemonError)>) {
    let mut classes = Vec::new();
    let mut failures = Vec::new();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), "cannot read configuration directory: {err}");
            return (classes, failures);
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|ext| ext == CONF_EXT).unwrap_or(false))
        .collect();
    paths.sort();

    for path in paths {
        match parse_job_file(&path, default_console) {
            Ok(class) => classes.push(class),
            Err(err) => {
                warn!(file = %path.display(), "rejected job definition: {err}");
                failures.push((path, err));
            }
        }
    }

    (classes, failures)
}
