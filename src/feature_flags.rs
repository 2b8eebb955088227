//! Process-wide feature flags
//!
//! Flags are write-once: a [`FeatureFlags`] value is built at startup from the
//! configured list and handed to every component by reference. Querying before
//! [`FeatureFlags::load`] reports every flag as disabled.

use crate::errors::{AttestError, AttestResult, SafeReadLock, SafeWriteLock};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    /// Exists purely for exercising the loader.
    TestFlag,
    /// Gates the whole attestation-and-policy path. Enabled by default once
    /// flags are loaded; `-Unified-Identity` turns it off.
    UnifiedIdentity,
}

impl Flag {
    pub const ALL: [Flag; 2] = [Flag::TestFlag, Flag::UnifiedIdentity];

    pub fn as_str(&self) -> &'static str {
        match self {
            Flag::TestFlag => "i_am_a_test_flag",
            Flag::UnifiedIdentity => "Unified-Identity",
        }
    }

    fn default_value(&self) -> bool {
        match self {
            Flag::TestFlag => false,
            Flag::UnifiedIdentity => true,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flag {
    type Err = AttestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Flag::ALL
            .into_iter()
            .find(|flag| flag.as_str() == s)
            .ok_or_else(|| AttestError::UnknownFeatureFlag {
                names: vec![s.to_string()],
            })
    }
}

#[derive(Debug)]
struct FlagState {
    loaded: bool,
    values: BTreeMap<Flag, bool>,
}

impl FlagState {
    fn defaults() -> Self {
        Self {
            loaded: false,
            values: Flag::ALL.iter().map(|f| (*f, f.default_value())).collect(),
        }
    }
}

#[derive(Debug)]
pub struct FeatureFlags {
    state: RwLock<FlagState>,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureFlags {
    /// Unloaded flag set; every flag reads as disabled.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(FlagState::defaults()),
        }
    }

    /// Build and load in one step, the way startup code is expected to.
    pub fn from_config<S: AsRef<str>>(raw: &[S]) -> AttestResult<Self> {
        let flags = Self::new();
        flags.load(raw)?;
        Ok(flags)
    }

    /// Apply the raw configuration list. A plain name enables the flag, a
    /// `-` prefix disables it and is applied after every enable. Fails on a
    /// second call or on any unknown name, in which case nothing is applied.
    pub fn load<S: AsRef<str>>(&self, raw: &[S]) -> AttestResult<()> {
        let mut state = self.state.safe_write()?;
        if state.loaded {
            return Err(AttestError::FlagsAlreadyLoaded);
        }

        let mut unknown = Vec::new();
        let mut updates = Vec::new();
        for entry in raw {
            let entry = entry.as_ref().trim();
            let (name, enable) = match entry.strip_prefix('-') {
                Some(name) => (name, false),
                None => (entry, true),
            };
            match name.parse::<Flag>() {
                Ok(flag) => updates.push((flag, enable)),
                Err(_) => unknown.push(entry.to_string()),
            }
        }

        if !unknown.is_empty() {
            unknown.sort();
            return Err(AttestError::UnknownFeatureFlag { names: unknown });
        }

        // Disables win over enables regardless of list order.
        updates.sort_by_key(|(_, enable)| !enable);
        for (flag, enable) in updates {
            state.values.insert(flag, enable);
        }
        state.loaded = true;
        tracing::debug!(flags = ?state.values, "feature flags loaded");
        Ok(())
    }

    /// Reset to the unloaded defaults. Intended for tests only.
    pub fn unload(&self) -> AttestResult<()> {
        let mut state = self.state.safe_write()?;
        if !state.loaded {
            return Err(AttestError::FlagsNotLoaded);
        }
        *state = FlagState::defaults();
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.state.safe_read().map(|s| s.loaded).unwrap_or(false)
    }

    pub fn is_set(&self, flag: Flag) -> bool {
        match self.state.safe_read() {
            Ok(state) => state.loaded && state.values.get(&flag).copied().unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Fail with [`AttestError::FeatureDisabled`] unless `flag` is set.
    pub fn require(&self, flag: Flag) -> AttestResult<()> {
        if self.is_set(flag) {
            Ok(())
        } else {
            Err(AttestError::feature_disabled(flag.as_str()))
        }
    }

    /// Flags currently enabled, in declaration order.
    pub fn enabled(&self) -> Vec<Flag> {
        Flag::ALL.into_iter().filter(|f| self.is_set(*f)).collect()
    }
}
