use anyhow::{anyhow, Result};
use kuchiki::parse_html;
use kuchiki::traits::*;

/// An inline classic script found in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InlineScript {
    /// Position among all `<script>` elements of the document.
    pub index: usize,
    pub code: String,
}

impl InlineScript {
    pub(crate) fn filename(&self) -> String {
        format!("inline-script-{}.js", self.index)
    }
}

/// Inline classic scripts of `html`, in document order.
///
/// External, module, `async` and `defer` scripts are skipped: a headless
/// page has nothing to fetch and no parser to defer against.
pub(crate) fn inline_classic_scripts(html: &str) -> Result<Vec<InlineScript>> {
    let parsed = parse_html().one(html);
    let selector = parsed
        .select("script")
        .map_err(|_| anyhow!("failed to compile selector"))?;

    let mut collected = Vec::new();
    for (index, script) in selector.enumerate() {
        let attributes = script.attributes.borrow();
        let has_src = attributes
            .get("src")
            .map(|src| !src.trim().is_empty())
            .unwrap_or(false);
        if has_src
            || !is_classic(attributes.get("type"))
            || attributes.get("async").is_some()
            || attributes.get("defer").is_some()
        {
            continue;
        }

        drop(attributes);
        let code = script.text_contents();
        if code.trim().is_empty() {
            continue;
        }
        collected.push(InlineScript { index, code });
    }

    Ok(collected)
}

fn is_classic(script_type: Option<&str>) -> bool {
    match script_type {
        Some(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "" | "text/javascript"
                | "application/javascript"
                | "text/ecmascript"
                | "application/ecmascript"
        ),
        None => true,
    }
}
