//! Build information for `potato version`.

/// Package version plus any build metadata injected at compile time.
pub fn version_string() -> String {
    let mut out = format!("potato {}", env!("CARGO_PKG_VERSION"));
    if let Some(commit) = option_env!("POTATO_GIT_COMMIT") {
        out.push_str(&format!("\ncommit: {commit}"));
    }
    if let Some(date) = option_env!("POTATO_BUILD_DATE") {
        out.push_str(&format!("\nbuilt: {date}"));
    }
    out
}
