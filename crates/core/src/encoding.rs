// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Filename-safe encoding of node paths.
//!
//! Artifact filenames embed the remote path; the URL-safe Base64 alphabet
//! (RFC 4648 §5: `-` for `+`, `_` for `/`) keeps the result inert in
//! filenames. Padding is retained.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;

/// URL/filename-safe Base64 of `text`.
pub fn safe_base64(text: &str) -> String {
    URL_SAFE.encode(text.as_bytes())
}

#[cfg(test)]
#[path = "encoding_tests.rs"]
mod tests;
