// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the gateway.
//!
//! Transcoding errors surface as 502 at the proxy boundary, mapping errors
//! as 500. Transport errors are retried once after a session rebuild before
//! being returned to the caller. Upstream non-2xx responses are never
//! errors: they are forwarded verbatim.

use thiserror::Error;

/// Errors produced by the gateway library.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed JSON input to the codec.
    #[error("JSON transcoding: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed CBOR input to the codec.
    #[error("CBOR transcoding: {0}")]
    Cbor(#[from] serde_cbor::Error),

    /// Two dictionary keys share the same integer value.
    #[error("key dictionary: duplicate integer {value} for key {key}")]
    DuplicateDictionaryValue { key: String, value: i64 },

    /// Two path codes share the same URL template.
    #[error("path template already defined: {0}")]
    DuplicateTemplate(String),

    /// A path template has unbalanced `{}` braces.
    #[error("unbalanced braces in path template {0:?}")]
    UnbalancedBraces(String),

    /// A `{…}` segment has an empty name or pattern.
    #[error("missing name or pattern in path template {0:?}")]
    EmptyPlaceholder(String),

    /// A path template compiled into an invalid matcher.
    #[error("bad matcher for path template {template:?}: {source}")]
    TemplateRegex {
        template: String,
        #[source]
        source: regex::Error,
    },

    /// HTTP method with no CoAP request code.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// CoAP code with no HTTP equivalent.
    #[error("unknown CoAP code: {0}")]
    UnknownCode(String),

    /// The CoAP message could not be parsed or built.
    #[error("malformed CoAP message: {0}")]
    Message(String),

    /// Session-level failure (gone, ACK timeout, retransmits exhausted,
    /// Reset from the peer).
    #[error("transport: {0}")]
    Transport(String),

    /// The request could not be forwarded at all.
    #[error("gateway failure: {0}")]
    Gateway(String),

    /// A target URL could not be parsed.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration validation failure.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// TOML parse failure when loading configuration.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
