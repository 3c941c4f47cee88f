// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hyper::{http::HeaderMap, StatusCode};
use std::collections::HashSet;
use std::fmt::Debug;

pub const TOKEN_HEADER: &str = "x-logjam-token";

/// Immutable set of tokens accepted by the intake, built once from configuration.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TokenSet {
    tokens: HashSet<String>,
}

impl TokenSet {
    /// Builds the set from a comma-separated list. Entries are trimmed and empty entries are
    /// discarded, so an unset or blank list produces an empty set and the empty string is never
    /// a valid token.
    pub fn from_config_str(tokens: &str) -> Self {
        Self {
            tokens: tokens
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenSet({} tokens)", self.tokens.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing key in request header")]
    MissingToken,

    #[error("invalid key")]
    InvalidToken,
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }
}

#[derive(Debug, Clone)]
pub struct AuthGate {
    tokens: TokenSet,
}

impl AuthGate {
    pub fn new(tokens: TokenSet) -> Self {
        Self { tokens }
    }

    /// Exact membership check against the configured tokens.
    pub fn validate(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    /// Checks the token header of an inbound request.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let token = headers
            .get(TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or(AuthError::MissingToken)?;
        if self.validate(token) {
            Ok(())
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}
