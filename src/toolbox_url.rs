//! `jetbrains://` URLs understood by the companion application.

/// URL that asks the IDE identified by `tool_tag` to clone `clone_url`.
pub fn get_toolbox_clone_url(tool_tag: &str, clone_url: &str) -> String {
    format!(
        "jetbrains://{tool_tag}/checkout/git?checkout.repo={clone_url}&idea.required.plugins.id=Git4Idea"
    )
}

/// URL that opens `file_path` inside `project`. `line_number` is one-based
/// (defaults to the first line); the emitted line and column are zero-based,
/// and the column is always the first one.
pub fn get_toolbox_navigate_url(
    tool_tag: &str,
    project: &str,
    file_path: &str,
    line_number: Option<u32>,
) -> String {
    let line_index = line_number.unwrap_or(1).saturating_sub(1);
    format!(
        "jetbrains://{tool_tag}/navigate/reference?project={project}&path={file_path}:{line_index}:0"
    )
}
