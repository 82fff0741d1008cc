use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};

/// Identifier for one outcome token within a market.
#[repr(transparent)]
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub String);

impl TokenId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for TokenId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TokenId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Borrow<str> for TokenId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a binary-outcome market (condition).
#[repr(transparent)]
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionId(pub String);

impl ConditionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for ConditionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConditionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Borrow<str> for ConditionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConditionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One outcome token of a market as reported by the CLOB API.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Token {
    #[serde(default)]
    pub token_id: TokenId,
    #[serde(default)]
    pub outcome: String,
}

/// Market metadata from the CLOB `/markets` endpoints.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClobMarket {
    #[serde(default)]
    pub condition_id: ConditionId,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub market_slug: String,
    #[serde(default)]
    pub tokens: Vec<Token>,
    #[serde(default)]
    pub neg_risk: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub closed: bool,
}

impl ClobMarket {
    /// The YES outcome token. Falls back to the first token when the
    /// outcomes of a two-token market are not labelled Yes/No.
    pub fn token_yes(&self) -> Option<&TokenId> {
        self.outcome_token("yes")
            .or_else(|| self.positional_token(0))
    }

    /// The NO outcome token, with the same positional fallback.
    pub fn token_no(&self) -> Option<&TokenId> {
        self.outcome_token("no").or_else(|| self.positional_token(1))
    }

    /// True when the market carries exactly two tokens with non-empty ids.
    pub fn has_valid_tokens(&self) -> bool {
        self.tokens.len() == 2
            && self
                .token_yes()
                .is_some_and(|token| !token.is_empty())
            && self.token_no().is_some_and(|token| !token.is_empty())
    }

    fn outcome_token(&self, outcome: &str) -> Option<&TokenId> {
        self.tokens
            .iter()
            .find(|token| token.outcome.eq_ignore_ascii_case(outcome))
            .map(|token| &token.token_id)
    }

    fn positional_token(&self, index: usize) -> Option<&TokenId> {
        if self.tokens.len() == 2 {
            self.tokens.get(index).map(|token| &token.token_id)
        } else {
            None
        }
    }
}

/// Resolved token pair for a market, as consumed by the orderbook manager.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    pub condition_id: ConditionId,
    pub token_yes: TokenId,
    pub token_no: TokenId,
    pub title: String,
    pub symbol: String,
    pub slug: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(outcomes: &[(&str, &str)]) -> ClobMarket {
        ClobMarket {
            condition_id: ConditionId::new("0xc0ffee"),
            tokens: outcomes
                .iter()
                .map(|(id, outcome)| Token {
                    token_id: TokenId::new(*id),
                    outcome: outcome.to_string(),
                })
                .collect(),
            ..ClobMarket::default()
        }
    }

    #[test]
    fn yes_no_tokens_by_outcome() {
        let m = market(&[("111", "Yes"), ("222", "No")]);
        assert_eq!(m.token_yes().unwrap().as_str(), "111");
        assert_eq!(m.token_no().unwrap().as_str(), "222");
        assert!(m.has_valid_tokens());
    }

    #[test]
    fn outcome_match_is_case_insensitive() {
        let m = market(&[("111", "YES"), ("222", "no")]);
        assert_eq!(m.token_yes().unwrap().as_str(), "111");
        assert_eq!(m.token_no().unwrap().as_str(), "222");
    }

    #[test]
    fn positional_fallback_for_unlabelled_outcomes() {
        let m = market(&[("111", "Up"), ("222", "Down")]);
        assert_eq!(m.token_yes().unwrap().as_str(), "111");
        assert_eq!(m.token_no().unwrap().as_str(), "222");
    }

    #[test]
    fn invalid_when_token_missing() {
        let m = market(&[("111", "Yes"), ("", "No")]);
        assert!(!m.has_valid_tokens());

        let m = market(&[("111", "Yes")]);
        assert!(m.token_yes().is_none());
        assert!(!m.has_valid_tokens());
    }

    #[test]
    fn token_id_borrows_as_str() {
        use std::collections::HashMap;

        let mut map: HashMap<TokenId, u32> = HashMap::new();
        map.insert(TokenId::new("111"), 1);
        assert_eq!(map.get("111"), Some(&1));
    }
}
