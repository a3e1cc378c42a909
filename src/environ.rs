//! KEY=VALUE environment array helpers.
//!
//! Job environments are ordered arrays of `KEY=VALUE` strings rather than
//! maps: events match their arguments positionally, and later writes must
//! overwrite earlier ones while preserving first-write order.

use std::sync::OnceLock;

use regex::Regex;

/// Returns the key part of a `KEY=VALUE` entry (the whole entry when it
/// carries no `=`).
pub fn key(entry: &str) -> &str {
    entry.split_once('=').map(|(k, _)| k).unwrap_or(entry)
}

/// Returns the value part of a `KEY=VALUE` entry, or `None` when the entry
/// carries no `=`.
pub fn value(entry: &str) -> Option<&str> {
    entry.split_once('=').map(|(_, v)| v)
}

/// Looks up `name` in an environment array, returning its value.
pub fn lookup<'a>(env: &'a [String], name: &str) -> Option<&'a str> {
    env.iter()
        .find(|entry| key(entry) == name)
        .and_then(|entry| value(entry))
}

/// Inserts or replaces an entry, keyed on the text before `=`.
///
/// Set semantics: an existing entry with the same key is overwritten in
/// place, otherwise the entry is appended.
pub fn set(env: &mut Vec<String>, entry: &str) {
    let name = key(entry);
    if let Some(existing) = env.iter_mut().find(|e| key(e) == name) {
        *existing = entry.to_string();
    } else {
        env.push(entry.to_string());
    }
}

/// Applies [`set`] for every entry of `extra`, in order.
pub fn append(env: &mut Vec<String>, extra: &[String]) {
    for entry in extra {
        set(env, entry);
    }
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(?:(\$)|([A-Za-z_][A-Za-z0-9_]*)|\{([A-Za-z_][A-Za-z0-9_]*)\})")
            .expect("reference pattern is valid")
    })
}

/// A failed `$VAR` expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpandError {
    /// The referenced variable is not present in the expansion environment.
    Unknown(String),
    /// A `$` with nothing usable after it.
    Trailing,
}

/// Expands `$NAME`, `${NAME}` and the `$$` escape against `env`.
///
/// References to unset variables are an error; event matching treats that
/// as a failed match rather than an empty substitution.
pub fn expand(input: &str, env: &[String]) -> Result<String, ExpandError> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;

    for caps in reference_pattern().captures_iter(input) {
        let whole = caps.get(0).expect("capture 0 always present");
        out.push_str(&input[last..whole.start()]);
        last = whole.end();

        if caps.get(1).is_some() {
            out.push('$');
            continue;
        }

        let name = caps
            .get(2)
            .or_else(|| caps.get(3))
            .expect("alternation matched a name")
            .as_str();
        match lookup(env, name) {
            Some(value) => out.push_str(value),
            None => return Err(ExpandError::Unknown(name.to_string())),
        }
    }

    // A bare trailing '$' (or '$<punct>') is not a reference.
    if let Some(rest) = input.get(last..) {
        if rest == "$" {
            return Err(ExpandError::Trailing);
        }
        out.push_str(rest);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn lookup_finds_values_by_key() {
        let env = env(&["PATH=/bin", "TERM=linux"]);
        assert_eq!(lookup(&env, "PATH"), Some("/bin"));
        assert_eq!(lookup(&env, "TERM"), Some("linux"));
        assert_eq!(lookup(&env, "HOME"), None);
    }

    #[test]
    fn set_overwrites_in_place() {
        let mut env = env(&["A=1", "B=2"]);
        set(&mut env, "A=3");
        set(&mut env, "C=4");
        assert_eq!(env, vec!["A=3", "B=2", "C=4"]);
    }

    #[test]
    fn append_applies_set_semantics() {
        let mut base = env(&["A=1", "B=2"]);
        append(&mut base, &env(&["B=5", "D=6"]));
        assert_eq!(base, vec!["A=1", "B=5", "D=6"]);
    }

    #[test]
    fn expand_substitutes_both_reference_forms() {
        let env = env(&["DEV=/dev/sdb1", "N=1"]);
        assert_eq!(expand("$DEV", &env).unwrap(), "/dev/sdb1");
        assert_eq!(expand("disk${N}", &env).unwrap(), "disk1");
        assert_eq!(expand("cost $$5", &env).unwrap(), "cost $5");
    }

    #[test]
    fn expand_fails_on_unset_variable() {
        let env = env(&["DEV=/dev/sdb1"]);
        assert_eq!(
            expand("$UNSET", &env),
            Err(ExpandError::Unknown("UNSET".to_string()))
        );
    }

    #[test]
    fn expand_passes_literals_through() {
        assert_eq!(expand("plain text", &[]).unwrap(), "plain text");
    }
}
