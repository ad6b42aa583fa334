//! Lockdown policy: block-list, whitelist, key combinations and mitigation switches.
//!
//! A policy is loaded once per session and never mutated while the session runs.
//! Field names follow the backend configuration API as aliases, so a policy exported
//! from the backend (`shortcutKeys`, `blockedApps`, `whitelistApps`, ...) loads as-is.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::{LockdownError, Result};
use crate::platform::ProcessInfo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockdownPolicy {
    #[serde(alias = "blockedProcessNames", alias = "blockedApps", alias = "blocked_apps")]
    pub blocked_processes: BTreeSet<String>,

    #[serde(
        alias = "whitelistedProcessNames",
        alias = "whitelistApps",
        alias = "whiteListApps",
        alias = "whitelist_apps"
    )]
    pub whitelisted_processes: BTreeSet<String>,

    #[serde(
        alias = "blockedKeyCombinations",
        alias = "shortcutKeys",
        alias = "shortcut_keys",
        deserialize_with = "lenient_combos"
    )]
    pub blocked_key_combinations: BTreeSet<KeyCombo>,

    #[serde(alias = "disableTouchpadGestures", alias = "disableTouchpad")]
    pub disable_touchpad_gestures: bool,

    #[serde(alias = "preventScreenLock")]
    pub prevent_screen_lock: bool,

    #[serde(alias = "blockVirtualMachines")]
    pub block_virtual_machines: bool,
}

impl Default for LockdownPolicy {
    fn default() -> Self {
        Self {
            blocked_processes: BTreeSet::new(),
            whitelisted_processes: BTreeSet::new(),
            blocked_key_combinations: BTreeSet::new(),
            disable_touchpad_gestures: true,
            prevent_screen_lock: true,
            block_virtual_machines: true,
        }
    }
}

impl LockdownPolicy {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let policy: Self =
            toml::from_str(content).map_err(|e| LockdownError::Policy(e.to_string()))?;
        Ok(policy.normalized())
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let policy: Self =
            serde_json::from_str(content).map_err(|e| LockdownError::Policy(e.to_string()))?;
        Ok(policy.normalized())
    }

    /// Load a policy file; `.json` is parsed as JSON, anything else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LockdownError::Policy(format!("cannot read {}: {}", path.display(), e))
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    /// Canonical form of every process entry; empty entries are dropped.
    pub fn normalized(mut self) -> Self {
        self.blocked_processes = self
            .blocked_processes
            .iter()
            .map(|n| normalize_process_name(n))
            .filter(|n| !n.is_empty())
            .collect();
        self.whitelisted_processes = self
            .whitelisted_processes
            .iter()
            .map(|n| normalize_whitelist_entry(n))
            .filter(|n| !n.is_empty())
            .collect();
        self
    }

    pub fn with_blocked<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.blocked_processes
            .extend(names.into_iter().map(|n| normalize_process_name(n.as_ref())));
        self
    }

    pub fn with_whitelist<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.whitelisted_processes
            .extend(names.into_iter().map(|n| normalize_whitelist_entry(n.as_ref())));
        self
    }

    pub fn with_combos<I, S>(mut self, combos: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for combo in combos {
            self.blocked_key_combinations.insert(combo.as_ref().parse()?);
        }
        Ok(self)
    }

    pub fn blocked_matcher(&self) -> ProcessMatcher {
        ProcessMatcher::new(&self.blocked_processes)
    }

    pub fn whitelist_matcher(&self) -> ProcessMatcher {
        ProcessMatcher::new(&self.whitelisted_processes)
    }

    pub fn blocked_combinations(&self) -> BlockedCombinations {
        BlockedCombinations::new(self.blocked_key_combinations.iter().copied())
    }
}

/// Unparseable entries are skipped; they could never match a key event anyway.
fn lenient_combos<'de, D>(deserializer: D) -> std::result::Result<BTreeSet<KeyCombo>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Vec::<String>::deserialize(deserializer)?;
    Ok(entries
        .iter()
        .filter_map(|entry| match entry.parse::<KeyCombo>() {
            Ok(combo) => Some(combo),
            Err(e) => {
                warn!("Ignoring {}", e);
                None
            }
        })
        .collect())
}

/// Canonical process name: trimmed, lower-cased, no directory, no `.exe` suffix.
pub fn normalize_process_name(name: &str) -> String {
    let trimmed = name.trim();
    let base = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    let lower = base.to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

fn is_path_entry(entry: &str) -> bool {
    entry.contains(['/', '\\'])
}

fn normalize_path(path: &str) -> String {
    path.trim().replace('\\', "/").to_lowercase()
}

fn normalize_whitelist_entry(entry: &str) -> String {
    if is_path_entry(entry) {
        normalize_path(entry)
    } else {
        normalize_process_name(entry)
    }
}

/// Case-insensitive matcher over process names and full executable paths.
#[derive(Debug, Clone, Default)]
pub struct ProcessMatcher {
    names: HashSet<String>,
    paths: HashSet<String>,
}

impl ProcessMatcher {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = Self::default();
        for entry in entries {
            let entry = entry.as_ref();
            if is_path_entry(entry) {
                matcher.paths.insert(normalize_path(entry));
            } else {
                let name = normalize_process_name(entry);
                if !name.is_empty() {
                    matcher.names.insert(name);
                }
            }
        }
        matcher
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.paths.is_empty()
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.names.contains(&normalize_process_name(name))
    }

    pub fn matches(&self, process: &ProcessInfo) -> bool {
        if self.matches_name(&process.name) {
            return true;
        }
        match &process.path {
            Some(path) if !self.paths.is_empty() => self
                .paths
                .contains(&normalize_path(&path.to_string_lossy())),
            _ => false,
        }
    }
}

/// Set of held modifier keys. Ordering of the flags never matters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Modifiers(u8);

impl Modifiers {
    pub const NONE: Self = Self(0);
    pub const CTRL: Self = Self(1);
    pub const ALT: Self = Self(2);
    pub const SHIFT: Self = Self(4);
    pub const WIN: Self = Self(8);

    const ALL: [(Self, &'static str); 4] = [
        (Self::CTRL, "Ctrl"),
        (Self::ALT, "Alt"),
        (Self::SHIFT, "Shift"),
        (Self::WIN, "Win"),
    ];

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "ctrl" | "control" | "lctrl" | "rctrl" | "lcontrol" | "rcontrol" | "leftctrl"
            | "rightctrl" => Some(Self::CTRL),
            "alt" | "menu" | "lalt" | "ralt" | "lmenu" | "rmenu" | "leftalt" | "rightalt" => {
                Some(Self::ALT)
            }
            "shift" | "lshift" | "rshift" | "leftshift" | "rightshift" => Some(Self::SHIFT),
            "win" | "windows" | "lwin" | "rwin" | "meta" | "super" | "cmd" => Some(Self::WIN),
            _ => None,
        }
    }

    /// Virtual key of the modifier itself (single flag only).
    fn key_code(self) -> Option<KeyCode> {
        match self {
            Self::CTRL => Some(KeyCode::CONTROL),
            Self::ALT => Some(KeyCode::MENU),
            Self::SHIFT => Some(KeyCode::SHIFT),
            Self::WIN => Some(KeyCode::LWIN),
            _ => None,
        }
    }
}

/// Windows virtual-key code, with left/right variants folded into the generic key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyCode(u16);

impl KeyCode {
    pub const SHIFT: Self = Self(0x10);
    pub const CONTROL: Self = Self(0x11);
    pub const MENU: Self = Self(0x12);
    pub const ESCAPE: Self = Self(0x1B);
    pub const TAB: Self = Self(0x09);
    pub const DELETE: Self = Self(0x2E);
    pub const LWIN: Self = Self(0x5B);

    /// Fold a raw virtual-key code into its canonical form.
    pub fn from_vk(vk: u16) -> Self {
        match vk {
            0xA0 | 0xA1 => Self::SHIFT,
            0xA2 | 0xA3 => Self::CONTROL,
            0xA4 | 0xA5 => Self::MENU,
            0x5C => Self::LWIN,
            other => Self(other),
        }
    }

    pub fn vk(self) -> u16 {
        self.0
    }

    /// The modifier flag this key sets when held, if it is a modifier key.
    pub fn as_modifier(self) -> Option<Modifiers> {
        match self {
            Self::CONTROL => Some(Modifiers::CTRL),
            Self::MENU => Some(Modifiers::ALT),
            Self::SHIFT => Some(Modifiers::SHIFT),
            Self::LWIN => Some(Modifiers::WIN),
            _ => None,
        }
    }

    fn from_name(token: &str) -> Option<Self> {
        let lower = token.to_ascii_lowercase();
        if let Some(hex) = lower.strip_prefix("0x") {
            return u16::from_str_radix(hex, 16).ok().map(Self::from_vk);
        }
        let bytes = lower.as_bytes();
        if bytes.len() == 1 {
            let c = bytes[0];
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                return Some(Self(u16::from(c.to_ascii_uppercase())));
            }
        }
        // WPF spells digits D0..D9.
        if bytes.len() == 2 && bytes[0] == b'd' && bytes[1].is_ascii_digit() {
            return Some(Self(u16::from(bytes[1])));
        }
        if let Some(n) = lower.strip_prefix("numpad").and_then(|n| n.parse::<u16>().ok()) {
            if n <= 9 {
                return Some(Self(0x60 + n));
            }
        }
        if let Some(n) = lower.strip_prefix('f').and_then(|n| n.parse::<u16>().ok()) {
            if (1..=24).contains(&n) {
                return Some(Self(0x6F + n));
            }
        }
        NAMED_KEYS
            .iter()
            .find(|(_, names)| names.contains(&lower.as_str()))
            .map(|(vk, _)| Self(*vk))
    }

    fn name(self) -> String {
        let vk = self.0;
        match vk {
            0x30..=0x39 | 0x41..=0x5A => char::from(vk as u8).to_string(),
            0x60..=0x69 => format!("NumPad{}", vk - 0x60),
            0x70..=0x87 => format!("F{}", vk - 0x6F),
            _ => match NAMED_KEYS.iter().find(|(code, _)| *code == vk) {
                Some((_, names)) => display_name(names[0]),
                None => format!("0x{:02X}", vk),
            },
        }
    }
}

const NAMED_KEYS: &[(u16, &[&str])] = &[
    (0x08, &["backspace", "back"]),
    (0x09, &["tab"]),
    (0x0D, &["enter", "return"]),
    (0x10, &["shift"]),
    (0x11, &["ctrl"]),
    (0x12, &["alt"]),
    (0x13, &["pause"]),
    (0x14, &["capslock", "capital"]),
    (0x1B, &["esc", "escape"]),
    (0x20, &["space"]),
    (0x21, &["pageup", "pgup", "prior"]),
    (0x22, &["pagedown", "pgdn", "next"]),
    (0x23, &["end"]),
    (0x24, &["home"]),
    (0x25, &["left"]),
    (0x26, &["up"]),
    (0x27, &["right"]),
    (0x28, &["down"]),
    (0x2C, &["printscreen", "prtsc", "prtscn", "snapshot"]),
    (0x2D, &["insert", "ins"]),
    (0x2E, &["del", "delete"]),
    (0x5B, &["win"]),
    (0x5D, &["apps", "contextmenu"]),
    (0x6A, &["multiply"]),
    (0x6B, &["add"]),
    (0x6D, &["subtract"]),
    (0x6E, &["decimal"]),
    (0x6F, &["divide"]),
    (0x90, &["numlock"]),
    (0x91, &["scrolllock", "scroll"]),
    (0xBA, &["oemsemicolon", "oem1"]),
    (0xBB, &["oemplus"]),
    (0xBC, &["oemcomma"]),
    (0xBD, &["oemminus"]),
    (0xBE, &["oemperiod"]),
    (0xBF, &["oemquestion", "oem2"]),
    (0xC0, &["oemtilde", "oem3"]),
    (0xDB, &["oemopenbrackets", "oem4"]),
    (0xDC, &["oempipe", "oem5"]),
    (0xDD, &["oemclosebrackets", "oem6"]),
    (0xDE, &["oemquotes", "oem7"]),
];

fn display_name(lower: &str) -> String {
    match lower {
        "esc" => "Esc".into(),
        "del" => "Del".into(),
        "printscreen" => "PrintScreen".into(),
        "pageup" => "PageUp".into(),
        "pagedown" => "PageDown".into(),
        "capslock" => "CapsLock".into(),
        "numlock" => "NumLock".into(),
        "scrolllock" => "ScrollLock".into(),
        "oemsemicolon" => "OemSemicolon".into(),
        "oemplus" => "OemPlus".into(),
        "oemcomma" => "OemComma".into(),
        "oemminus" => "OemMinus".into(),
        "oemperiod" => "OemPeriod".into(),
        "oemquestion" => "OemQuestion".into(),
        "oemtilde" => "OemTilde".into(),
        "oemopenbrackets" => "OemOpenBrackets".into(),
        "oempipe" => "OemPipe".into(),
        "oemclosebrackets" => "OemCloseBrackets".into(),
        "oemquotes" => "OemQuotes".into(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        }
    }
}

/// A primary key plus the modifiers held with it, written `Ctrl+Shift+Esc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyCombo {
    pub modifiers: Modifiers,
    pub key: KeyCode,
}

impl KeyCombo {
    /// Canonicalizes the key and drops the key's own modifier flag, so pressing
    /// Ctrl while Alt is held is `Alt+Ctrl` rather than `Ctrl+Alt+Ctrl`.
    pub fn new(modifiers: Modifiers, key: KeyCode) -> Self {
        let key = KeyCode::from_vk(key.vk());
        let mut modifiers = modifiers;
        if let Some(own) = key.as_modifier() {
            modifiers.remove(own);
        }
        Self { modifiers, key }
    }

    pub fn bare(key: KeyCode) -> Self {
        Self::new(Modifiers::NONE, key)
    }
}

impl FromStr for KeyCombo {
    type Err = LockdownError;

    fn from_str(input: &str) -> Result<Self> {
        let invalid = |reason: &str| LockdownError::InvalidKeyCombo {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let mut modifiers = Modifiers::NONE;
        let mut last_modifier = None;
        let mut key = None;
        for token in input.split('+').map(str::trim) {
            if token.is_empty() {
                return Err(invalid("empty key name"));
            }
            if let Some(flag) = Modifiers::from_token(token) {
                modifiers.insert(flag);
                last_modifier = Some(flag);
                continue;
            }
            if key.is_some() {
                return Err(invalid("more than one non-modifier key"));
            }
            key = Some(KeyCode::from_name(token).ok_or_else(|| invalid("unknown key"))?);
        }

        let key = match (key, last_modifier) {
            (Some(key), _) => key,
            // Modifiers only: the last one is the key being pressed.
            (None, Some(flag)) => {
                modifiers.remove(flag);
                flag.key_code().ok_or_else(|| invalid("unknown key"))?
            }
            (None, None) => return Err(invalid("empty key name")),
        };
        Ok(Self::new(modifiers, key))
    }
}

impl fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (flag, name) in Modifiers::ALL {
            if self.modifiers.contains(flag) {
                write!(f, "{}+", name)?;
            }
        }
        f.write_str(&self.key.name())
    }
}

impl TryFrom<String> for KeyCombo {
    type Error = LockdownError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<KeyCombo> for String {
    fn from(combo: KeyCombo) -> Self {
        combo.to_string()
    }
}

/// Lookup structure consulted from the keyboard hook callback.
#[derive(Debug, Clone, Default)]
pub struct BlockedCombinations {
    exact: HashSet<KeyCombo>,
    bare: HashSet<KeyCode>,
}

impl BlockedCombinations {
    pub fn new<I: IntoIterator<Item = KeyCombo>>(combos: I) -> Self {
        let mut blocked = Self::default();
        for combo in combos {
            if combo.modifiers.is_empty() {
                blocked.bare.insert(combo.key);
            } else {
                blocked.exact.insert(combo);
            }
        }
        blocked
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.bare.is_empty()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.bare.len()
    }

    /// Bare-key entries match whatever modifiers are held.
    pub fn matches(&self, event: &KeyCombo) -> bool {
        self.bare.contains(&event.key) || self.exact.contains(event)
    }
}
