//! Plugin registry
//!
//! A static table from `(kind, language, name)` to the behavior a tool gets.
//! Entries naming a language or a tool name are preferred over generic ones.

use crate::core::spec::ToolKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Spawns the descriptor's command
    External,
    /// External, and a non-zero exit code still counts as success
    Execute,
    /// Runs only after a crash, against the core dump
    Debug,
    /// External compiler whose output is parsed into diagnostics
    Gcc,
    /// In-process code patching through the language plugin
    Patch,
    /// In-process source checks through the language plugin
    Parse,
}

struct PluginEntry {
    kind: &'static str,
    language: Option<&'static str>,
    name: Option<&'static str>,
    behavior: Behavior,
    /// Usable without any registry entry
    standalone: bool,
}

const fn entry(kind: &'static str, behavior: Behavior, standalone: bool) -> PluginEntry {
    PluginEntry {
        kind,
        language: None,
        name: None,
        behavior,
        standalone,
    }
}

const fn named(kind: &'static str, name: &'static str, behavior: Behavior) -> PluginEntry {
    PluginEntry {
        kind,
        language: None,
        name: Some(name),
        behavior,
        standalone: false,
    }
}

static PLUGINS: &[PluginEntry] = &[
    entry("execute", Behavior::Execute, true),
    entry("debug", Behavior::Debug, false),
    entry("patch", Behavior::Patch, true),
    entry("parse", Behavior::Parse, true),
    named("compile", "gcc", Behavior::Gcc),
    named("compile", "g++", Behavior::Gcc),
    named("compile", "clang", Behavior::Gcc),
    named("compile", "clang++", Behavior::Gcc),
];

impl PluginEntry {
    fn matches(&self, kind: &ToolKind, language: &str, name: &str) -> bool {
        self.kind == kind.as_str()
            && self
                .language
                .map_or(true, |l| l.eq_ignore_ascii_case(language))
            && self.name.map_or(true, |n| n == name)
    }

    fn is_specific(&self) -> bool {
        self.language.is_some() || self.name.is_some()
    }
}

/// Behavior for a registry-backed tool, if a plugin wraps it
pub fn find_plugin(kind: &ToolKind, language: &str, name: &str) -> Option<Behavior> {
    let mut generic = None;
    for plugin in PLUGINS.iter().filter(|p| p.matches(kind, language, name)) {
        if plugin.is_specific() {
            return Some(plugin.behavior);
        }
        generic.get_or_insert(plugin.behavior);
    }
    generic
}

/// Behavior for a tool with no registry entry at all
pub fn find_standalone(kind: &ToolKind, language: &str) -> Option<Behavior> {
    PLUGINS
        .iter()
        .find(|p| p.standalone && p.matches(kind, language, ""))
        .map(|p| p.behavior)
}
