use tracing::warn;

use crate::mixer::clamp_volume;

/// Session start options shared by the programmatic and administrative
/// surfaces.
///
/// Single-character flags: `q` quiet announce, `b` bridged-only, `a`
/// append, `g(name)` group filter, `r(basename)` recording
/// side-channel, `v(N)` read volume, `V(N)` write volume, `W(N)` both.
/// Volume factors are clamped to [-4, 4].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub quiet: bool,
    pub bridged_only: bool,
    pub append: bool,
    pub group: Option<String>,
    pub record: Option<String>,
    pub read_volume: i8,
    pub write_volume: i8,
}

impl Default for StartOptions {
    fn default() -> Self {
        StartOptions {
            quiet: false,
            bridged_only: false,
            append: false,
            group: None,
            record: None,
            read_volume: 0,
            write_volume: 0,
        }
    }
}

/// Parsed `filename|options|command` start argument.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StartSpec {
    pub filename: Option<String>,
    pub options: StartOptions,
    pub command: Option<String>,
}

pub fn parse_start_spec(args: &str) -> StartSpec {
    let mut parts = args.splitn(3, '|');
    let filename = parts
        .next()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string);
    let options = parts.next().map(parse_flags).unwrap_or_default();
    let command = parts
        .next()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string);
    StartSpec {
        filename,
        options,
        command,
    }
}

fn parse_flags(flags: &str) -> StartOptions {
    let mut options = StartOptions::default();
    let mut chars = flags.trim().chars().peekable();
    while let Some(flag) = chars.next() {
        match flag {
            'q' => options.quiet = true,
            'b' => options.bridged_only = true,
            'a' => options.append = true,
            'g' => {
                if let Some(value) = take_argument(&mut chars, flag) {
                    options.group = Some(value);
                }
            }
            'r' => {
                // bare r records under the default basename
                options.record = Some(
                    take_argument(&mut chars, flag).unwrap_or_else(|| "chanspy".to_string()),
                );
            }
            'v' => {
                if let Some(factor) = take_volume(&mut chars, flag) {
                    options.read_volume = factor;
                }
            }
            'V' => {
                if let Some(factor) = take_volume(&mut chars, flag) {
                    options.write_volume = factor;
                }
            }
            'W' => {
                if let Some(factor) = take_volume(&mut chars, flag) {
                    options.read_volume = factor;
                    options.write_volume = factor;
                }
            }
            flag if flag.is_whitespace() => {}
            flag => warn!("unknown option flag '{flag}' skipped"),
        }
    }
    options
}

fn take_argument(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    flag: char,
) -> Option<String> {
    if chars.peek() != Some(&'(') {
        return None;
    }
    chars.next();
    let mut value = String::new();
    for c in chars.by_ref() {
        if c == ')' {
            return Some(value);
        }
        value.push(c);
    }
    warn!("unterminated argument for option flag '{flag}'");
    None
}

fn take_volume(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    flag: char,
) -> Option<i8> {
    let value = take_argument(chars, flag)?;
    match value.trim().parse::<i32>() {
        Ok(factor) => Some(clamp_volume(factor)),
        Err(_) => {
            warn!("invalid volume '{value}' for option flag '{flag}' skipped");
            None
        }
    }
}
