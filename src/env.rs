use crate::command::ExitCode;
use std::collections::HashMap;
use std::env as stdenv;

/// Variable store shared by every line the interpreter runs.
///
/// The store holds:
/// - `vars`: variables written by assignment lines and read by `$NAME` substitution.
///   The whole map becomes the environment of every external program the shell spawns.
/// - `pending_exit`: set by the `exit` built-in so the read loop knows when to stop.
///
/// The working directory is not tracked here: `cd` changes the process directory
/// directly, which is what forked children inherit.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
    pending_exit: Option<ExitCode>,
}

impl Environment {
    /// Snapshot the current process environment into a new store.
    ///
    /// Variables whose name or value is not valid unicode are skipped.
    pub fn new() -> Self {
        Self::from_vars(stdenv::vars_os().filter_map(|(k, v)| {
            Some((k.into_string().ok()?, v.into_string().ok()?))
        }))
    }

    /// An isolated store with no variables at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a store from explicit name/value pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            pending_exit: None,
        }
    }

    /// Get the value of a variable.
    pub fn get_var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    /// Set or override a variable.
    pub fn set_var(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.vars.insert(key.into(), val.into());
    }

    /// Iterate over every variable in the store, in no particular order.
    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Ask the read loop to stop after the current line.
    pub fn request_exit(&mut self, code: ExitCode) {
        self.pending_exit = Some(code);
    }

    /// Exit code requested by `exit`, if any.
    pub fn pending_exit(&self) -> Option<ExitCode> {
        self.pending_exit
    }
}
