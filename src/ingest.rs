use anyhow::{anyhow, Context, Result};
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use tracing::info;

use crate::ai::{extract_jd_structure, AIProvider, JdStructure};

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const MIN_PASTED_CHARS: usize = 200;
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

// Page chrome that never carries job description text
const NOISE_TAGS: [&str; 6] = ["script", "style", "nav", "footer", "header", "aside"];

// Tried in order; the first match is treated as the description body
const CONTENT_SELECTORS: [&str; 6] = [
    "main",
    "article",
    "#job-description",
    ".job-description",
    ".description",
    "body",
];

#[derive(Debug, Clone)]
pub struct IngestedJd {
    pub structure: JdStructure,
    pub raw_text: String,
    pub source_url: Option<String>,
}

/// Parse a job description from a URL or pasted text and extract its structure.
pub fn ingest_jd(provider: &dyn AIProvider, source: &str) -> Result<IngestedJd> {
    let (raw_text, source_url) = load_source(source)?;
    info!(chars = raw_text.len(), "extracting JD structure");
    let structure = extract_jd_structure(provider, &raw_text)?;
    Ok(IngestedJd { structure, raw_text, source_url })
}

fn load_source(source: &str) -> Result<(String, Option<String>)> {
    let source = source.trim();
    if source.to_lowercase().starts_with("http") {
        info!(url = source, "fetching JD");
        let text = fetch_url(source)?;
        Ok((text, Some(source.to_string())))
    } else if source.chars().count() > MIN_PASTED_CHARS {
        Ok((source.to_string(), None))
    } else {
        Err(anyhow!(
            "Source must be a URL or text >{} characters. Got {} chars.",
            MIN_PASTED_CHARS,
            source.chars().count()
        ))
    }
}

fn fetch_url(url: &str) -> Result<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .user_agent(BROWSER_USER_AGENT)
        .build()?;
    let body = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.text())
        .with_context(|| format!("Could not fetch JD from URL: {}", url))?;
    let text = html_to_text(&body);
    if text.is_empty() {
        return Err(anyhow!("No readable text found at {}", url));
    }
    Ok(text)
}

/// Visible text of the page's main content area, one trimmed line per text run.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = CONTENT_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|sel| document.select(&sel).next())
        .unwrap_or_else(|| document.root_element());
    collect_text(root)
}

fn collect_text(root: ElementRef) -> String {
    let mut lines = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else { continue };
        let in_noise = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| NOISE_TAGS.contains(&e.name()))
        });
        if in_noise {
            continue;
        }
        lines.extend(text.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::tests::MockProvider;

    const PAGE: &str = r#"<html><head><style>.x{color:red}</style></head><body>
        <header>Careers Home</header>
        <nav><a href="/">Jobs</a></nav>
        <main>
          <h1>Senior Analytics Manager</h1>
          <p>Own the KPI stack.</p>
          <script>trackPageView();</script>
          <ul><li>SQL</li><li>Tableau</li></ul>
        </main>
        <footer>(c) Acme</footer>
        </body></html>"#;

    #[test]
    fn test_html_to_text_prefers_main_and_drops_noise() {
        let text = html_to_text(PAGE);
        assert_eq!(text, "Senior Analytics Manager\nOwn the KPI stack.\nSQL\nTableau");
    }

    #[test]
    fn test_html_to_text_falls_back_to_body() {
        let html = "<html><body><nav>menu</nav><div>Data Manager role</div><aside>ads</aside></body></html>";
        assert_eq!(html_to_text(html), "Data Manager role");
    }

    #[test]
    fn test_short_text_is_rejected() {
        let provider = MockProvider::new(&[]);
        let err = ingest_jd(&provider, "Analytics Manager at Acme").unwrap_err();
        assert!(err.to_string().contains("Got 25 chars"));
        assert!(provider.prompts.borrow().is_empty());
    }

    #[test]
    fn test_pasted_text_is_structured() {
        let provider = MockProvider::new(&[r#"{"company": "Acme", "role_title": "BI Manager"}"#]);
        let jd_text = "We are hiring a BI Manager. ".repeat(10);
        let ingested = ingest_jd(&provider, &jd_text).unwrap();
        assert_eq!(ingested.structure.company.as_deref(), Some("Acme"));
        assert_eq!(ingested.raw_text, jd_text.trim());
        assert!(ingested.source_url.is_none());
    }
}
