// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP <-> CoAP path translation.
//!
//! Long static URL prefixes fold down into a single URI-friendly byte, with
//! dynamic path segments overlaid in the order they appear in the full
//! form:
//!
//! ```text
//! /_matrix/client/r0/sync                                            <->  /7
//! /_matrix/client/r0/user/@frank:localhost/account_data/im.vector.setting.breadcrumbs
//!                                                                    <->  /r/@frank:localhost/im.vector.setting.breadcrumbs
//! ```
//!
//! Unknown paths pass through unchanged in both directions; the gateway is
//! not a general proxy and only the enumerated set is compressed.

mod v1;

pub use v1::v1_templates;

use std::collections::HashMap;

use regex::Regex;

use crate::error::{Error, Result};

/// A compiled URL template such as
/// `/_matrix/client/r0/rooms/{roomId}/send/{eventType}/{txnId}`.
struct CompiledTemplate {
    code: String,
    /// Anchored matcher with one capture group per `{…}` segment and an
    /// optional trailing slash.
    matcher: Regex,
    /// Placeholder names in template order, kept for debugging.
    #[allow(dead_code)]
    vars: Vec<String>,
}

/// The bidirectional path table.
pub struct PathSet {
    /// code -> template with `{placeholder}` variables.
    templates: HashMap<String, String>,
    matchers: Vec<CompiledTemplate>,
}

impl PathSet {
    /// Compile a path table. Keys are the single-byte path codes, values the
    /// HTTP path templates; placeholders MUST be enclosed in `{}`. Each
    /// template may appear only once.
    ///
    /// Prefer [`PathSet::v1`], which installs the interoperable enum paths;
    /// this constructor exists for bleeding edge or custom tables.
    pub fn new(templates: HashMap<String, String>) -> Result<Self> {
        let mut seen = HashMap::with_capacity(templates.len());
        let mut matchers = Vec::with_capacity(templates.len());
        // Sorted so that first-match-wins scans are deterministic.
        let mut entries: Vec<(&String, &String)> = templates.iter().collect();
        entries.sort();
        for (code, template) in entries {
            if seen.insert(template.clone(), code.clone()).is_some() {
                return Err(Error::DuplicateTemplate(template.clone()));
            }
            let (matcher, vars) = compile_template(template)?;
            matchers.push(CompiledTemplate {
                code: code.clone(),
                matcher,
                vars,
            });
        }
        Ok(Self { templates, matchers })
    }

    /// The v1 enum path table.
    pub fn v1() -> Self {
        Self::new(v1_templates()).expect("v1 path table is well-formed")
    }

    /// Convert a CoAP enum path such as `/7` into the full HTTP path. The
    /// input is returned unchanged when the first segment is not a known
    /// code. Extracted dynamic segments are percent-escaped because they
    /// are assembled into an HTTP URL; excess CoAP segments are dropped.
    pub fn coap_to_http(&self, p: &str) -> String {
        let path = with_leading_slash(p);
        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() < 2 {
            return p.to_string();
        }
        let template = match self.templates.get(segments[1]) {
            Some(t) => t,
            None => return p.to_string(),
        };
        if segments.len() > 2 {
            // There are user params to overlay.
            let mut out: Vec<String> = template.split('/').map(str::to_string).collect();
            let mut next = 2;
            for seg in out.iter_mut() {
                if next >= segments.len() {
                    break;
                }
                if seg.starts_with('{') {
                    *seg = escape_path_segment(segments[next]);
                    next += 1;
                }
            }
            return out.join("/");
        }
        template.clone()
    }

    /// Convert an HTTP path such as `/_matrix/client/r0/sync` into its CoAP
    /// enum path. The input is returned unchanged when no template matches.
    /// Never encodes or decodes: CoAP Uri-Path options carry raw bytes and
    /// the caller supplies the decoded HTTP path.
    pub fn http_to_coap(&self, p: &str) -> String {
        let path = with_leading_slash(p);
        // The table is small enough for a linear scan.
        for ct in &self.matchers {
            let caps = match ct.matcher.captures(&path) {
                Some(c) => c,
                None => continue,
            };
            let params: Vec<&str> = caps
                .iter()
                .skip(1)
                .flatten()
                .map(|m| m.as_str())
                .collect();
            return if params.is_empty() {
                format!("/{}", ct.code)
            } else {
                format!("/{}/{}", ct.code, params.join("/"))
            };
        }
        p.to_string()
    }
}

fn with_leading_slash(p: &str) -> String {
    if p.starts_with('/') {
        p.to_string()
    } else {
        format!("/{}", p)
    }
}

/// Compile one template into an anchored matcher with a capture group per
/// placeholder. A `{name:pattern}` segment overrides the default `[^/]+`.
fn compile_template(template: &str) -> Result<(Regex, Vec<String>)> {
    let spans = brace_spans(template)?;
    let mut tpl = template;
    if let Some(stripped) = tpl.strip_suffix('/') {
        tpl = stripped;
    }
    let mut pattern = String::from("^");
    let mut vars = Vec::with_capacity(spans.len());
    let mut end = 0;
    for &(start, stop) in &spans {
        if start >= tpl.len() {
            break;
        }
        pattern.push_str(&regex::escape(&tpl[end..start]));
        let inner = &tpl[start + 1..stop - 1];
        let (name, patt) = match inner.split_once(':') {
            Some((n, p)) => (n, p),
            None => (inner, "[^/]+"),
        };
        if name.is_empty() || patt.is_empty() {
            return Err(Error::EmptyPlaceholder(template.to_string()));
        }
        pattern.push('(');
        pattern.push_str(patt);
        pattern.push(')');
        vars.push(name.to_string());
        end = stop;
    }
    pattern.push_str(&regex::escape(&tpl[end..]));
    pattern.push_str("[/]?$");
    let matcher = Regex::new(&pattern).map_err(|source| Error::TemplateRegex {
        template: template.to_string(),
        source,
    })?;
    Ok((matcher, vars))
}

/// First-level `{}` spans as `(open_index, one_past_close_index)` pairs.
fn brace_spans(s: &str) -> Result<Vec<(usize, usize)>> {
    let mut level = 0i32;
    let mut open = 0;
    let mut spans = Vec::new();
    for (i, b) in s.bytes().enumerate() {
        match b {
            b'{' => {
                level += 1;
                if level == 1 {
                    open = i;
                }
            }
            b'}' => {
                level -= 1;
                if level == 0 {
                    spans.push((open, i + 1));
                } else if level < 0 {
                    return Err(Error::UnbalancedBraces(s.to_string()));
                }
            }
            _ => {}
        }
    }
    if level != 0 {
        return Err(Error::UnbalancedBraces(s.to_string()));
    }
    Ok(spans)
}

/// Percent-escape one path segment the way it must appear inside an HTTP
/// URL: unreserved characters, sub-delims, `:` and `@` stay literal.
fn escape_path_segment(s: &str) -> String {
    const KEEP: &[u8] = b"-._~!$&'()*+,;=:@";
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if b.is_ascii_alphanumeric() || KEEP.contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}
