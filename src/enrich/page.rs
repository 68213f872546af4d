//! Landing-page content features: hidden iframes, off-site favicons, form
//! handlers and the redirect chain that led to the page.

use once_cell::sync::Lazy;
use reqwest::Url;
use scraper::{Html, Selector};

use crate::encode::url::registrable_domain;

/// Chains longer than this are flagged.
pub const MAX_BENIGN_REDIRECTS: u32 = 1;

/// What a page fetch returned: the final URL after redirects, how many hops
/// it took and a size-capped prefix of the HTML.
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub final_url: String,
    pub redirects: u32,
    pub html: String,
}

/// Page features. Computed right after the fetch; the parsed document is
/// not kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSignals {
    pub hidden_iframe: bool,
    pub external_favicon: bool,
    /// A form posts nowhere (`""`, `about:blank`) or to another site.
    pub foreign_form_handler: bool,
    pub redirects: u32,
}

impl PageSignals {
    pub fn excessive_redirects(&self) -> bool {
        self.redirects > MAX_BENIGN_REDIRECTS
    }
}

static IFRAME: Lazy<Selector> = Lazy::new(|| Selector::parse("iframe").expect("iframe selector"));
static ICON: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"link[rel~="icon"]"#).expect("icon selector"));
static FORM: Lazy<Selector> = Lazy::new(|| Selector::parse("form").expect("form selector"));

fn is_hidden_iframe(style: Option<&str>, width: Option<&str>, height: Option<&str>) -> bool {
    let style: String = style
        .unwrap_or_default()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let hidden_style = ["display:none", "visibility:hidden", "width:0", "height:0"]
        .iter()
        .any(|rule| style.contains(rule));
    let zero = |v: Option<&str>| v.is_some_and(|v| v.trim() == "0");
    hidden_style || (zero(width) && zero(height))
}

/// Registrable domain of `href` resolved against `base`; `None` for
/// non-web targets.
fn site_of(base: Option<&Url>, href: &str) -> Option<String> {
    let url = match base {
        Some(b) => b.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str().map(|h| registrable_domain(&h.to_ascii_lowercase()))
}

pub fn extract(snapshot: &PageSnapshot) -> PageSignals {
    let base = Url::parse(&snapshot.final_url).ok();
    let own = base
        .as_ref()
        .and_then(|u| u.host_str())
        .map(|h| registrable_domain(&h.to_ascii_lowercase()));
    let doc = Html::parse_document(&snapshot.html);

    let hidden_iframe = doc.select(&IFRAME).any(|el| {
        let v = el.value();
        is_hidden_iframe(v.attr("style"), v.attr("width"), v.attr("height"))
    });

    let external_favicon = doc
        .select(&ICON)
        .filter_map(|el| el.value().attr("href"))
        .any(|href| site_of(base.as_ref(), href.trim()) != own);

    let foreign_form_handler = doc.select(&FORM).any(|el| match el.value().attr("action") {
        // No action posts back to the page itself.
        None => false,
        Some(action) => {
            let action = action.trim();
            action.is_empty()
                || action.eq_ignore_ascii_case("about:blank")
                || site_of(base.as_ref(), action) != own
        }
    });

    PageSignals {
        hidden_iframe,
        external_favicon,
        foreign_form_handler,
        redirects: snapshot.redirects,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(html: &str, redirects: u32) -> PageSignals {
        extract(&PageSnapshot {
            final_url: "https://login.example.com/account".into(),
            redirects,
            html: html.into(),
        })
    }

    #[test]
    fn plain_page_has_no_signals() {
        let s = page(
            r#"<html><head><link rel="icon" href="/favicon.ico"></head>
               <body><form action="/session" method="post"></form>
               <iframe src="/embed" width="300" height="200"></iframe></body></html>"#,
            0,
        );
        assert_eq!(s, PageSignals::default());
    }

    #[test]
    fn hidden_iframes_by_style_or_zero_size() {
        assert!(page(r#"<iframe src="x" style="display: none"></iframe>"#, 0).hidden_iframe);
        assert!(page(r#"<iframe src="x" style="VISIBILITY:hidden;"></iframe>"#, 0).hidden_iframe);
        assert!(page(r#"<iframe src="x" width="0" height="0"></iframe>"#, 0).hidden_iframe);
        assert!(!page(r#"<iframe src="x" width="0" height="90"></iframe>"#, 0).hidden_iframe);
    }

    #[test]
    fn favicon_from_another_site() {
        let s = page(r#"<link rel="shortcut icon" href="https://cdn.bank-brand.net/f.ico">"#, 0);
        assert!(s.external_favicon);
        // Subdomains of the same site are fine.
        let s = page(r#"<link rel="icon" href="https://static.example.com/f.ico">"#, 0);
        assert!(!s.external_favicon);
    }

    #[test]
    fn form_handlers_that_leave_the_site() {
        assert!(page(r#"<form action=""></form>"#, 0).foreign_form_handler);
        assert!(page(r#"<form action="about:blank"></form>"#, 0).foreign_form_handler);
        assert!(page(r#"<form action="https://collect.evil.tk/p"></form>"#, 0).foreign_form_handler);
        assert!(page(r#"<form action="mailto:x@evil.tk"></form>"#, 0).foreign_form_handler);
        assert!(!page(r#"<form></form>"#, 0).foreign_form_handler);
    }

    #[test]
    fn more_than_one_redirect_is_excessive() {
        assert!(!page("", 1).excessive_redirects());
        assert!(page("", 2).excessive_redirects());
    }
}
