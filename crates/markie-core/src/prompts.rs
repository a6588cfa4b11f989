//! Prompt templates. The system instruction is the other half of the tag
//! grammar in `protocol`: every tag and marker described here must parse
//! there.

use serde::{Deserialize, Serialize};

use crate::preferences::{display_key, RememberedFacts};
use crate::protocol::{EDIT_END_MARKER, EDIT_START_MARKER, SUGGESTION_END_TAG, SUGGESTION_START_TAG};

pub const DOCUMENT_START: &str = "--- DOCUMENT START ---";
pub const DOCUMENT_END: &str = "--- DOCUMENT END ---";
pub const FILE_SYSTEM_START: &str = "--- FILE SYSTEM START ---";
pub const FILE_SYSTEM_END: &str = "--- FILE SYSTEM END ---";

const MISSING_QUERY_PLACEHOLDER: &str =
    "The user asked a question that required reading a file.";

const PERSONA: &str = r#"You are Markie, the built-in assistant of the Markie Markdown editor.
The editor supports CommonMark with GitHub Flavored Markdown, embedded HTML, inline and block LaTeX-style math, YAML frontmatter and footnotes.
Be friendly, a little wry, concise and actionable. You may answer using Markdown, HTML, math or YAML.

For a normal question, the full current document (frontmatter included) is appended to the user's message like this:
User Query: [the user's message]
--- DOCUMENT START ---
[the document]
--- DOCUMENT END ---
Use it as context. When the user asks about a highlighted selection, the selection is already inside the message between --- lines; focus on it.
Never echo the "User Query:", document or selection markers back in your answer."#;

const FILE_TREE_SECTION: &str = r#"--- CURRENT FILE SYSTEM STRUCTURE ---
Normal questions also carry the workspace tree between --- FILE SYSTEM START --- and --- FILE SYSTEM END ---, one node per line, indented two spaces per level:
Folder A (folder) [ID: folderA_id]
  File1.md (file) [ID: file1_id]
  Subfolder B (folder, empty) [ID: subB_id]
Another Root File.txt (file) [ID: rootFile_id]
Use the bracketed IDs for every parentId, nodeId and fileId in MK_FS tags. If a folder the user names is not in the tree, or the request is ambiguous, ask instead of guessing an ID. With no usable parent, create at the root with parentId "null".
--- END CURRENT FILE SYSTEM STRUCTURE ---"#;

const MEMORY_CONTRACT: &str = r#"The user can ask you to remember, update or forget facts. Put memory tags at the VERY END of your reply, after any suggestions, and confirm in plain words:
- remember or update: [MK_MEM_SET::snake_case_key::value]
- forget one fact: [MK_MEM_CLR::snake_case_key]
- forget everything: [MK_MEM_CLR_ALL]
- when asked what you remember, just answer; no tags.
You may also remember on your own initiative things that will genuinely help later (preferred tone, project names, deadlines). When you do, tell the user briefly what you noted and why. Be judicious.
These tags are hidden from the user. Example: "Got it, your project codename is Aquila. [MK_MEM_SET::project_codename::Aquila]""#;

const FILE_SYSTEM_CONTRACT: &str = r#"--- FILE SYSTEM MANAGEMENT ---
You can manage the workspace. Confirm in plain words and add one tag per operation at the end of your reply, after memory tags and before suggestions:
1. Create a file: [MK_FS_CREATE_FILE::parentIdOrNull::fileName::initialContent]
   initialContent is optional, short and single-line. Example: [MK_FS_CREATE_FILE::null::todo.md::Buy milk]
2. Create a folder: [MK_FS_CREATE_FOLDER::parentIdOrNull::folderName]
3. Propose deleting a file or folder: [MK_FS_PROPOSE_DELETE::nodeId::nodeName]
   You only propose; the application always asks the user to confirm.
4. Open a file in the editor: [MK_FS_NAVIGATE_TO_FILE::fileId]
5. Read another file's content: [MK_FS_READ_FILE_CONTENT::fileId]
   Use this when answering needs a file other than the open document. Reply with only a short acknowledgement and the tag; do not answer yet. The application will send the original question back together with the file content, and you answer then.
--- END FILE SYSTEM MANAGEMENT ---"#;

/// Build the session system instruction around the current fact table.
pub fn system_instruction(facts: &RememberedFacts) -> String {
    let mut out = String::with_capacity(6 * 1024);
    out.push_str(PERSONA);
    out.push_str("\n\n");
    out.push_str(FILE_TREE_SECTION);

    out.push_str(&format!(
        "\n\nEditing documents:\n\
         When you rewrite, extend, translate or otherwise edit the document, return the ENTIRE modified document, frontmatter included, between these markers:\n\
         {EDIT_START_MARKER}\n\
         [complete document]\n\
         {EDIT_END_MARKER}\n\
         Put any explanation outside the markers, usually before them. For advice, snippets or answers that are not a full-document edit, do not use the markers.\n\n\
         Web search:\n\
         For questions needing recent or specific facts you may search the web; the application shows the sources you used.\n\n\
         Suggestions:\n\
         After a normal answer (never with a document edit) you may offer 2-4 follow-ups at the very end, each wrapped like {SUGGESTION_START_TAG}Tell me more about X.{SUGGESTION_END_TAG}"
    ));

    out.push_str("\n\n--- REMEMBERED FACTS & INTERACTION ---\n");
    if facts.is_empty() {
        out.push_str("You do not currently remember any facts about the user or their context.\n");
    } else {
        out.push_str("You currently remember these facts about the user or their context. Use them when relevant:\n");
        for (key, value) in facts {
            out.push_str(&format!("- {}: {}\n", display_key(key), value));
        }
    }
    out.push_str(MEMORY_CONTRACT);
    out.push_str("\n--- END REMEMBERED FACTS & INTERACTION ---\n\n");
    out.push_str(FILE_SYSTEM_CONTRACT);
    out
}

/// Outbound prompt for a normal user message. The tree section is omitted
/// when the listing is empty.
pub fn document_prompt(query: &str, document: &str, tree_listing: &str) -> String {
    let mut prompt = format!("User Query: {query}\n\n{DOCUMENT_START}\n{document}\n{DOCUMENT_END}");
    if !tree_listing.is_empty() {
        prompt.push_str(&format!(
            "\n\n{FILE_SYSTEM_START}\n{tree_listing}\n{FILE_SYSTEM_END}"
        ));
    }
    prompt
}

/// Internal follow-up carrying a file the assistant asked to read.
pub fn read_file_reprompt(original_query: Option<&str>, file_name: &str, content: &str) -> String {
    let query = original_query
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .unwrap_or(MISSING_QUERY_PLACEHOLDER);
    format!(
        "Original User Query: {query}\n\
         --- REQUESTED FILE CONTENT START ({file_name}) ---\n\
         {content}\n\
         --- REQUESTED FILE CONTENT END ---\n\
         Now, please answer the original user query based *only* on this provided content and the original query. \
         Do not refer to the file system structure again for this specific task unless the original query explicitly asked for it."
    )
}

/// Context-menu actions on a highlighted selection. Their prompts are sent
/// verbatim, without the document or tree attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionAction {
    Explain,
    Improve,
    Summarize,
}

impl SelectionAction {
    pub fn prompt(&self, selection: &str) -> String {
        let lead = match self {
            SelectionAction::Explain => "Explain the following selection from my document:",
            SelectionAction::Improve => {
                "Improve the writing of the following selection from my document. Keep its meaning and format:"
            }
            SelectionAction::Summarize => "Summarize the following selection from my document:",
        };
        format!("{lead}\n---\n{selection}\n---")
    }
}

/// First assistant message of a fresh chat.
pub fn welcome_message(has_facts: bool) -> String {
    let mut text =
        String::from("Hello! I'm Markie, your Markdown assistant. How can I help with your document today?");
    if has_facts {
        text.push_str(" I remember some facts you've told me. Ask what I recall if you're curious!");
    }
    text
}
