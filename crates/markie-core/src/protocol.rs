//! Action-tag protocol engine.
//!
//! Assistant replies are prose interleaved with machine-readable markup:
//!
//! - memory tags: `[MK_MEM_SET::key::value]`, `[MK_MEM_CLR::key]`, `[MK_MEM_CLR_ALL]`
//! - file-system tags: `[MK_FS_CREATE_FILE::parentIdOrNull::name(::content)]`,
//!   `[MK_FS_CREATE_FOLDER::parentIdOrNull::name]`,
//!   `[MK_FS_PROPOSE_DELETE::nodeId::name]`, `[MK_FS_NAVIGATE_TO_FILE::fileId]`,
//!   `[MK_FS_READ_FILE_CONTENT::fileId]`
//! - full-document edit markers wrapping a replacement document
//! - `[SUGGESTION]..[/SUGGESTION]` follow-up prompts
//!
//! Everything here is pure: the engine never touches the file system map or
//! storage. It returns display text, the updated fact table and typed
//! actions for the owner to apply.

use std::sync::LazyLock;

use tracing::debug;

use crate::preferences::{display_key, update_fact, RememberedFacts};
use crate::types::{FsAction, Notification, NotificationKind};

pub const EDIT_START_MARKER: &str = "%%% START EDITED DOCUMENT %%%";
pub const EDIT_END_MARKER: &str = "%%% END EDITED DOCUMENT %%%";
pub const SUGGESTION_START_TAG: &str = "[SUGGESTION]";
pub const SUGGESTION_END_TAG: &str = "[/SUGGESTION]";
pub const DEFAULT_PROPOSAL_COMMENTARY: &str = "Markie has proposed an update to the document.";

const MEMORY_TAG_PATTERN: &str = r"\[MK_MEM_(SET|CLR|CLR_ALL)(?:::(?:(\w+)::(.+?)|(\w+))?)?\]";
const FS_TAG_PATTERN: &str = r"\[MK_FS_(CREATE_FILE|CREATE_FOLDER|PROPOSE_DELETE|NAVIGATE_TO_FILE|READ_FILE_CONTENT)::([\w-]+|null)(?:::(.*?))?(?:::(.*?))?\]";

/// Both tag families in one alternation so stripping is a single pass.
/// Groups: 1 memory op, 2 set key, 3 set value, 4 clear key,
/// 5 fs op, 6..8 positional fs arguments.
static ACTION_TAG_RE: LazyLock<regex_lite::Regex> = LazyLock::new(|| {
    regex_lite::Regex::new(&format!("(?:{MEMORY_TAG_PATTERN})|(?:{FS_TAG_PATTERN})"))
        .expect("action tag regex")
});

static SUGGESTION_RE: LazyLock<regex_lite::Regex> = LazyLock::new(|| {
    regex_lite::Regex::new(r"\[SUGGESTION\](.*?)\[/SUGGESTION\]").expect("suggestion regex")
});

// ── Edit proposals ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditParse {
    pub commentary: String,
    /// Replacement document, present only when both markers are well-formed.
    pub document: Option<String>,
}

impl EditParse {
    pub fn is_proposal(&self) -> bool {
        self.document.is_some()
    }
}

/// Split a reply into commentary and a proposed document. Malformed markers
/// (missing end, end before start) leave the whole text as commentary.
pub fn parse_edit_proposal(text: &str) -> EditParse {
    let (Some(start), Some(end)) = (text.find(EDIT_START_MARKER), text.find(EDIT_END_MARKER))
    else {
        return EditParse {
            commentary: text.to_string(),
            document: None,
        };
    };
    if end <= start {
        return EditParse {
            commentary: text.to_string(),
            document: None,
        };
    }

    let pre = text[..start].trim();
    let document = text[start + EDIT_START_MARKER.len()..end].trim().to_string();
    let post = text[end + EDIT_END_MARKER.len()..].trim();

    let mut commentary = format!("{pre} {post}").trim().to_string();
    if commentary.is_empty() && !document.is_empty() {
        commentary = DEFAULT_PROPOSAL_COMMENTARY.to_string();
    }
    EditParse {
        commentary,
        document: Some(document),
    }
}

// ── Action tags ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagOutcome {
    pub cleaned_text: String,
    pub facts_changed: bool,
    pub facts: RememberedFacts,
    /// In the order the tags appeared.
    pub actions: Vec<FsAction>,
    /// One entry per memory tag processed.
    pub memory_feedback: Vec<Notification>,
}

/// Remove every memory and file-system tag.
pub fn strip_action_tags(text: &str) -> String {
    ACTION_TAG_RE.replace_all(text, "").trim().to_string()
}

/// Collect and strip all action tags, applying memory tags to a copy of
/// `facts`. Tags missing required arguments are stripped but ignored.
pub fn process_action_tags(raw: &str, facts: &RememberedFacts) -> TagOutcome {
    let mut facts = facts.clone();
    let mut facts_changed = false;
    let mut actions = Vec::new();
    let mut memory_feedback = Vec::new();

    for caps in ACTION_TAG_RE.captures_iter(raw) {
        let group = |i: usize| caps.get(i).map(|m| m.as_str()).filter(|s| !s.is_empty());

        if let Some(op) = group(1) {
            let outcome = apply_memory_tag(&facts, op, group(2), group(3), group(4));
            if let Some((next, feedback)) = outcome {
                if next != facts {
                    facts = next;
                    facts_changed = true;
                }
                memory_feedback.push(feedback);
            }
        } else if let (Some(op), Some(first)) = (group(5), group(6)) {
            match fs_action(op, first, group(7), group(8)) {
                Some(action) => actions.push(action),
                None => debug!("Dropping incomplete MK_FS_{} tag", op),
            }
        }
    }

    TagOutcome {
        cleaned_text: strip_action_tags(raw),
        facts_changed,
        facts,
        actions,
        memory_feedback,
    }
}

fn apply_memory_tag(
    facts: &RememberedFacts,
    op: &str,
    set_key: Option<&str>,
    set_value: Option<&str>,
    clear_key: Option<&str>,
) -> Option<(RememberedFacts, Notification)> {
    match op {
        "SET" => {
            let (key, value) = (set_key?, set_value?);
            let shown = display_key(key);
            if facts.get(key).map(String::as_str) == Some(value) {
                Some((
                    facts.clone(),
                    Notification::new(
                        NotificationKind::Info,
                        format!("Markie already knows {shown} is \"{value}\"."),
                    ),
                ))
            } else {
                Some((
                    update_fact(facts, key, Some(value)),
                    Notification::new(
                        NotificationKind::Success,
                        format!("Markie remembers {shown} is \"{value}\"."),
                    ),
                ))
            }
        }
        "CLR" => {
            let key = clear_key?;
            let shown = display_key(key);
            if facts.contains_key(key) {
                Some((
                    update_fact(facts, key, None),
                    Notification::new(NotificationKind::Info, format!("Markie forgot about {shown}.")),
                ))
            } else {
                Some((
                    facts.clone(),
                    Notification::new(
                        NotificationKind::Info,
                        format!("Markie didn't know about '{shown}'."),
                    ),
                ))
            }
        }
        "CLR_ALL" => {
            let text = if facts.is_empty() {
                "Markie had no facts to forget."
            } else {
                "Markie forgot all remembered facts."
            };
            Some((
                RememberedFacts::new(),
                Notification::new(NotificationKind::Info, text),
            ))
        }
        _ => None,
    }
}

fn fs_action(op: &str, first: &str, second: Option<&str>, third: Option<&str>) -> Option<FsAction> {
    let parent = || (first != "null").then(|| first.to_string());
    let action = match op {
        "CREATE_FILE" => FsAction::CreateFile {
            parent_id: parent(),
            file_name: second?.to_string(),
            initial_content: third.map(String::from),
        },
        "CREATE_FOLDER" => FsAction::CreateFolder {
            parent_id: parent(),
            folder_name: second?.to_string(),
        },
        "PROPOSE_DELETE" => FsAction::ProposeDelete {
            node_id: first.to_string(),
            node_name: second?.to_string(),
        },
        "NAVIGATE_TO_FILE" => FsAction::NavigateToFile {
            file_id: first.to_string(),
        },
        "READ_FILE_CONTENT" => FsAction::ReadFileContent {
            file_id: first.to_string(),
        },
        _ => return None,
    };
    Some(action)
}

// ── Suggestions ──

/// Returns the body before the first suggestion (trimmed) and each
/// suggestion's trimmed text in order. Text without suggestions is returned
/// trimmed and unchanged.
pub fn extract_suggestions(text: &str) -> (String, Vec<String>) {
    let Some(first) = SUGGESTION_RE.find(text) else {
        return (text.trim().to_string(), Vec::new());
    };
    let body = text[..first.start()].trim().to_string();
    let suggestions = SUGGESTION_RE
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .collect();
    (body, suggestions)
}

// ── Whole reply ──

/// Everything the caller needs to finalize an assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpretation {
    pub display_text: String,
    pub proposal: Option<String>,
    pub suggestions: Vec<String>,
    pub facts_changed: bool,
    pub facts: RememberedFacts,
    pub actions: Vec<FsAction>,
    pub memory_feedback: Vec<Notification>,
}

/// Run the full pipeline. Order matters: the edit block is detected on the
/// raw text first and suppresses suggestion parsing; tags are collected from
/// the raw text in one pass (including any inside a proposed document);
/// suggestions are only parsed from the tag-stripped text of non-proposals.
pub fn interpret_response(raw: &str, facts: &RememberedFacts) -> Interpretation {
    let edit = parse_edit_proposal(raw);
    let tags = process_action_tags(raw, facts);

    let (display_text, proposal, suggestions) = match edit.document {
        Some(document) => {
            let document = strip_action_tags(&document);
            let mut commentary =
                strip_action_tags(&SUGGESTION_RE.replace_all(&edit.commentary, ""));
            if commentary.is_empty() && !document.is_empty() {
                commentary = DEFAULT_PROPOSAL_COMMENTARY.to_string();
            }
            (commentary, Some(document), Vec::new())
        }
        None => {
            let (body, suggestions) = extract_suggestions(&tags.cleaned_text);
            (body, None, suggestions)
        }
    };

    Interpretation {
        display_text,
        proposal,
        suggestions,
        facts_changed: tags.facts_changed,
        facts: tags.facts,
        actions: tags.actions,
        memory_feedback: tags.memory_feedback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(pairs: &[(&str, &str)]) -> RememberedFacts {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_stripping_is_complete_and_ordered() {
        let raw = "Done! I made the file.\n\
                   [MK_MEM_SET::favorite_color::sky blue]\n\
                   [MK_FS_CREATE_FILE::folder-1::ideas.md]\n\
                   [SUGGESTION]Open it?[/SUGGESTION]\n\
                   [SUGGESTION]Add a heading[/SUGGESTION]";
        let out = interpret_response(raw, &RememberedFacts::new());

        assert_eq!(out.display_text, "Done! I made the file.");
        for needle in ["MK_MEM", "MK_FS", "[SUGGESTION]", "[/SUGGESTION]"] {
            assert!(!out.display_text.contains(needle));
        }
        assert!(out.facts_changed);
        assert_eq!(out.facts.get("favorite_color").unwrap(), "sky blue");
        assert_eq!(
            out.actions,
            vec![FsAction::CreateFile {
                parent_id: Some("folder-1".into()),
                file_name: "ideas.md".into(),
                initial_content: None,
            }]
        );
        assert_eq!(out.suggestions, vec!["Open it?", "Add a heading"]);
        assert_eq!(out.memory_feedback.len(), 1);
        assert_eq!(out.memory_feedback[0].kind, NotificationKind::Success);
        assert_eq!(
            out.memory_feedback[0].text,
            "Markie remembers favorite color is \"sky blue\"."
        );
    }

    #[test]
    fn test_edit_markers_extracted() {
        let raw = format!("Here you go. {EDIT_START_MARKER}\nBODY\n{EDIT_END_MARKER} Thanks.");
        let parsed = parse_edit_proposal(&raw);
        assert_eq!(parsed.document.as_deref(), Some("BODY"));
        assert_eq!(parsed.commentary, "Here you go. Thanks.");
    }

    #[test]
    fn test_edit_markers_default_commentary() {
        let raw = format!("{EDIT_START_MARKER}\n# New\n{EDIT_END_MARKER}");
        let parsed = parse_edit_proposal(&raw);
        assert!(parsed.is_proposal());
        assert_eq!(parsed.commentary, DEFAULT_PROPOSAL_COMMENTARY);
    }

    #[test]
    fn test_malformed_markers_are_commentary() {
        let reversed = format!("a {EDIT_END_MARKER} b {EDIT_START_MARKER} c");
        let parsed = parse_edit_proposal(&reversed);
        assert!(!parsed.is_proposal());
        assert_eq!(parsed.commentary, reversed);

        let unterminated = format!("a {EDIT_START_MARKER} b");
        assert!(!parse_edit_proposal(&unterminated).is_proposal());
    }

    #[test]
    fn test_proposal_suppresses_suggestions_and_strips_tags() {
        let raw = format!(
            "Rewrote it. [MK_MEM_SET::tone::formal]\n{EDIT_START_MARKER}\n# Doc\n{EDIT_END_MARKER}\n[SUGGESTION]More?[/SUGGESTION]"
        );
        let out = interpret_response(&raw, &RememberedFacts::new());
        assert_eq!(out.proposal.as_deref(), Some("# Doc"));
        assert!(out.suggestions.is_empty());
        assert!(!out.display_text.contains("MK_MEM"));
        assert_eq!(out.display_text, "Rewrote it.");
        assert!(out.facts_changed);

        let inside = format!("{EDIT_START_MARKER}\n# Doc [MK_MEM_SET::tone::terse]\n{EDIT_END_MARKER}");
        let out = interpret_response(&inside, &RememberedFacts::new());
        assert_eq!(out.proposal.as_deref(), Some("# Doc"));
        assert_eq!(out.facts.get("tone").map(String::as_str), Some("terse"));
    }

    #[test]
    fn test_proposal_with_only_markup_gets_default_commentary() {
        let raw = format!(
            "[MK_MEM_SET::tone::formal]\n{EDIT_START_MARKER}\n# Doc\n{EDIT_END_MARKER}\n[SUGGESTION]Again?[/SUGGESTION]"
        );
        let out = interpret_response(&raw, &RememberedFacts::new());
        assert_eq!(out.display_text, DEFAULT_PROPOSAL_COMMENTARY);
        assert_eq!(out.proposal.as_deref(), Some("# Doc"));
        assert_eq!(out.facts.get("tone").map(String::as_str), Some("formal"));
    }

    #[test]
    fn test_clear_all_on_empty_facts() {
        let out = process_action_tags("Sure. [MK_MEM_CLR_ALL]", &RememberedFacts::new());
        assert!(!out.facts_changed);
        assert_eq!(out.cleaned_text, "Sure.");
        assert_eq!(out.memory_feedback[0].text, "Markie had no facts to forget.");
    }

    #[test]
    fn test_clear_all_variants() {
        let known = facts(&[("a", "1"), ("b", "2")]);
        for raw in ["[MK_MEM_CLR_ALL]", "[MK_MEM_CLR_ALL::]"] {
            let out = process_action_tags(raw, &known);
            assert!(out.facts_changed);
            assert!(out.facts.is_empty());
            assert_eq!(out.cleaned_text, "");
            assert_eq!(out.memory_feedback[0].text, "Markie forgot all remembered facts.");
        }
    }

    #[test]
    fn test_set_same_value_is_idempotent() {
        let known = facts(&[("project_id", "XYZ")]);
        let out = process_action_tags("[MK_MEM_SET::project_id::XYZ]", &known);
        assert!(!out.facts_changed);
        assert_eq!(out.facts, known);
        assert_eq!(out.memory_feedback[0].kind, NotificationKind::Info);
        assert_eq!(
            out.memory_feedback[0].text,
            "Markie already knows project id is \"XYZ\"."
        );
    }

    #[test]
    fn test_clear_known_and_unknown_keys() {
        let known = facts(&[("project_id", "XYZ")]);
        let out = process_action_tags("[MK_MEM_CLR::project_id] [MK_MEM_CLR::deadline]", &known);
        assert!(out.facts_changed);
        assert!(out.facts.is_empty());
        let texts: Vec<&str> = out.memory_feedback.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["Markie forgot about project id.", "Markie didn't know about 'deadline'."]
        );
    }

    #[test]
    fn test_fs_tags_parse_all_kinds() {
        let raw = "[MK_FS_CREATE_FILE::null::todo.txt::Buy milk]\
                   [MK_FS_CREATE_FOLDER::null::Meeting Notes]\
                   [MK_FS_PROPOSE_DELETE::folder123::Old Stuff]\
                   [MK_FS_NAVIGATE_TO_FILE::filexyz]\
                   [MK_FS_READ_FILE_CONTENT::file_abc-123]";
        let out = process_action_tags(raw, &RememberedFacts::new());
        assert_eq!(out.cleaned_text, "");
        assert_eq!(
            out.actions,
            vec![
                FsAction::CreateFile {
                    parent_id: None,
                    file_name: "todo.txt".into(),
                    initial_content: Some("Buy milk".into()),
                },
                FsAction::CreateFolder {
                    parent_id: None,
                    folder_name: "Meeting Notes".into(),
                },
                FsAction::ProposeDelete {
                    node_id: "folder123".into(),
                    node_name: "Old Stuff".into(),
                },
                FsAction::NavigateToFile {
                    file_id: "filexyz".into(),
                },
                FsAction::ReadFileContent {
                    file_id: "file_abc-123".into(),
                },
            ]
        );
    }

    #[test]
    fn test_incomplete_fs_tags_dropped() {
        let out = process_action_tags(
            "ok [MK_FS_CREATE_FOLDER::null] [MK_FS_PROPOSE_DELETE::n1]",
            &RememberedFacts::new(),
        );
        assert!(out.actions.is_empty());
        assert_eq!(out.cleaned_text, "ok");
    }

    #[test]
    fn test_suggestions_without_tags() {
        let (body, suggestions) = extract_suggestions("  Plain answer.  ");
        assert_eq!(body, "Plain answer.");
        assert!(suggestions.is_empty());

        let (body, suggestions) =
            extract_suggestions("Body\n[SUGGESTION] One [/SUGGESTION] trailing");
        assert_eq!(body, "Body");
        assert_eq!(suggestions, vec!["One"]);
    }
}
