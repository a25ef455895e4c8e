//! # Navigation Directives
//!
//! The assistant can point the user at a part of the app by embedding a marker in
//! its text, e.g. `Your refills are listed here <<Ref: section/meds>>`, or by sending a
//! `tools_update` message. Directives are parsed as soon as they arrive, but the
//! session only applies them after the turn's speech has finished.
//!
//! ## Marker Grammar:
//! - `<<Ref: section/<id>>>` → dashboard section
//! - `<<Ref: app/<path>>>`   → arbitrary app route
//! - `<<Ref: <id>>>`         → dashboard section by id

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Strict form emitted by the backend prompt.
static PRIMARY_MARKER: OnceLock<Regex> = OnceLock::new();
/// Tolerates spacing/case drift and a missing closing bracket.
static FALLBACK_MARKER: OnceLock<Regex> = OnceLock::new();

fn primary_marker() -> &'static Regex {
    PRIMARY_MARKER.get_or_init(|| {
        Regex::new(r"<<Ref:\s*([A-Za-z0-9_\-./]+)\s*>>").expect("primary marker pattern is valid")
    })
}

fn fallback_marker() -> &'static Regex {
    FALLBACK_MARKER.get_or_init(|| {
        Regex::new(r"(?i)<<\s*ref\s*[:=]?\s*([^<>]+?)\s*>>?").expect("fallback marker pattern is valid")
    })
}

/// Sections of the clinical dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DashboardSection {
    Overview,
    Conditions,
    Medications,
    Labs,
    DiagnosticReports,
    Symptoms,
    Documents,
    Other(String),
}

impl DashboardSection {
    /// Resolve a section id, accepting the short aliases the assistant uses.
    pub fn from_id(id: &str) -> Self {
        match id.trim().to_ascii_lowercase().as_str() {
            "overview" | "home" | "dashboard" => DashboardSection::Overview,
            "conditions" | "condition" => DashboardSection::Conditions,
            "meds" | "medication" | "medications" => DashboardSection::Medications,
            "labs" | "lab" | "lab-results" | "lab_results" => DashboardSection::Labs,
            "reports" | "diagnostic-reports" | "diagnostic_reports" | "diagnostics" => {
                DashboardSection::DiagnosticReports
            }
            "symptoms" | "symptom" => DashboardSection::Symptoms,
            "documents" | "docs" => DashboardSection::Documents,
            other => DashboardSection::Other(other.to_string()),
        }
    }

    /// Canonical id used in routes.
    pub fn id(&self) -> &str {
        match self {
            DashboardSection::Overview => "overview",
            DashboardSection::Conditions => "conditions",
            DashboardSection::Medications => "medications",
            DashboardSection::Labs => "labs",
            DashboardSection::DiagnosticReports => "diagnostic-reports",
            DashboardSection::Symptoms => "symptoms",
            DashboardSection::Documents => "documents",
            DashboardSection::Other(id) => id,
        }
    }
}

/// Where a directive sends the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationTarget {
    Section(DashboardSection),
    Route(String),
}

impl NavigationTarget {
    /// In-app route for this target.
    pub fn route(&self) -> String {
        match self {
            NavigationTarget::Section(section) => format!("/dashboard/{}", section.id()),
            NavigationTarget::Route(path) => format!("/{}", path.trim_start_matches('/')),
        }
    }
}

impl fmt::Display for NavigationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.route())
    }
}

/// Parse the inside of a marker (`section/meds`, `app/settings/profile`, `labs`).
pub fn parse_reference(reference: &str) -> Option<NavigationTarget> {
    let reference = reference.trim().trim_matches('/');
    if reference.is_empty() {
        return None;
    }

    if let Some(id) = reference.strip_prefix("section/") {
        let id = id.trim_matches('/');
        return (!id.is_empty()).then(|| NavigationTarget::Section(DashboardSection::from_id(id)));
    }

    if let Some(path) = reference.strip_prefix("app/") {
        let path = path.trim_matches('/');
        return (!path.is_empty()).then(|| NavigationTarget::Route(path.to_string()));
    }

    if reference.contains('/') {
        debug!(reference, "Ignoring reference with unknown prefix");
        return None;
    }

    Some(NavigationTarget::Section(DashboardSection::from_id(reference)))
}

/// Find the navigation directive in a piece of assistant text.
///
/// The strict pattern wins whenever it matches; the loose one is only consulted when
/// the strict one finds nothing. With several markers the last one is used.
pub fn find_directive(text: &str) -> Option<NavigationTarget> {
    let strict = primary_marker()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).and_then(|m| parse_reference(m.as_str())))
        .last();
    if strict.is_some() {
        return strict;
    }

    let loose = fallback_marker()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).and_then(|m| parse_reference(m.as_str())))
        .last();
    if let Some(target) = &loose {
        debug!(target = %target, "Navigation marker matched only the fallback pattern");
    }
    loose
}

/// Interpret a `tools_update` message.
pub fn from_tools_update(
    action: Option<&str>,
    target: Option<&str>,
    text: Option<&str>,
) -> Option<NavigationTarget> {
    if let Some(target) = target {
        match action.map(|a| a.to_ascii_lowercase()) {
            None => return parse_reference(target),
            Some(action) if action == "navigate" || action == "open" => {
                return parse_reference(target)
            }
            Some(action) => debug!(%action, "Ignoring non-navigation tool action"),
        }
    }

    text.and_then(find_directive)
}

/// Remove markers from text that is shown to the user.
///
/// Only the spaces around each marker are collapsed; line breaks are kept.
pub fn strip_markers(text: &str) -> String {
    let stripped = remove_matches(text, primary_marker());
    remove_matches(&stripped, fallback_marker()).trim().to_string()
}

fn remove_matches(text: &str, pattern: &Regex) -> String {
    const BLANK: [char; 2] = [' ', '\t'];

    let mut out = String::with_capacity(text.len());
    let mut rest = 0;
    for found in pattern.find_iter(text) {
        out.push_str(&text[rest..found.start()]);
        out.truncate(out.trim_end_matches(BLANK).len());

        let after = text[found.end()..].trim_start_matches(BLANK);
        rest = text.len() - after.len();
        let joins_words = !out.is_empty() && !out.ends_with('\n') && !after.is_empty() && !after.starts_with('\n');
        if joins_words {
            out.push(' ');
        }
    }
    out.push_str(&text[rest..]);
    out
}

/// Application shell hooks the session drives.
///
/// ## Why a trait:
/// The session decides *when* to navigate or log out; the surrounding application
/// decides *how*. Tests plug in a recorder, the binary plugs in a logger.
pub trait Navigator: Send {
    fn navigate(&mut self, target: &NavigationTarget);
    fn force_logout(&mut self);
}

/// Navigator for headless runs: logs what a UI would do.
#[derive(Debug, Default)]
pub struct LoggingNavigator;

impl Navigator for LoggingNavigator {
    fn navigate(&mut self, target: &NavigationTarget) {
        info!(route = %target.route(), "Navigating");
    }

    fn force_logout(&mut self) {
        warn!("Session unauthorized, logging out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_grammar() {
        assert_eq!(
            parse_reference("section/meds"),
            Some(NavigationTarget::Section(DashboardSection::Medications))
        );
        assert_eq!(
            parse_reference("app/settings/profile"),
            Some(NavigationTarget::Route("settings/profile".into()))
        );
        assert_eq!(
            parse_reference("labs"),
            Some(NavigationTarget::Section(DashboardSection::Labs))
        );
        assert_eq!(
            parse_reference("allergies"),
            Some(NavigationTarget::Section(DashboardSection::Other("allergies".into())))
        );
        assert_eq!(parse_reference("section/"), None);
        assert_eq!(parse_reference("weird/thing"), None);
        assert_eq!(parse_reference("   "), None);
    }

    #[test]
    fn test_routes() {
        let meds = NavigationTarget::Section(DashboardSection::Medications);
        assert_eq!(meds.route(), "/dashboard/medications");
        assert_eq!(NavigationTarget::Route("documents/upload".into()).route(), "/documents/upload");
    }

    #[test]
    fn test_find_directive_in_text() {
        let text = "Your prescriptions are here <<Ref: section/meds>>.";
        assert_eq!(
            find_directive(text),
            Some(NavigationTarget::Section(DashboardSection::Medications))
        );
        assert_eq!(find_directive("No markers at all."), None);
    }

    #[test]
    fn test_last_marker_wins() {
        let text = "<<Ref: section/labs>> and then <<Ref: app/documents>>";
        assert_eq!(find_directive(text), Some(NavigationTarget::Route("documents".into())));
    }

    #[test]
    fn test_fallback_only_when_strict_misses() {
        let sloppy = "See << ref: symptoms >";
        assert_eq!(
            find_directive(sloppy),
            Some(NavigationTarget::Section(DashboardSection::Symptoms))
        );

        // A strict match elsewhere in the text takes precedence over a sloppy one.
        let mixed = "<<ref symptoms>> then <<Ref: section/conditions>>";
        assert_eq!(
            find_directive(mixed),
            Some(NavigationTarget::Section(DashboardSection::Conditions))
        );
    }

    #[test]
    fn test_tools_update() {
        assert_eq!(
            from_tools_update(Some("navigate"), Some("section/reports"), None),
            Some(NavigationTarget::Section(DashboardSection::DiagnosticReports))
        );
        assert_eq!(from_tools_update(Some("highlight"), Some("section/labs"), None), None);
        assert_eq!(
            from_tools_update(None, None, Some("Opening <<Ref: app/settings>>")),
            Some(NavigationTarget::Route("settings".into()))
        );
    }

    #[test]
    fn test_strip_markers() {
        assert_eq!(
            strip_markers("Here are your meds <<Ref: section/meds>> for today."),
            "Here are your meds for today."
        );
        assert_eq!(
            strip_markers("Your labs are in.\n\nSee <<Ref: section/labs>>\nfor details. <<Ref: app/settings>>"),
            "Your labs are in.\n\nSee\nfor details."
        );
        assert_eq!(strip_markers("Line one\n  indented line"), "Line one\n  indented line");
    }
}
