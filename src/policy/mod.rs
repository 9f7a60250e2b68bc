//! Versioned allow-list policy: rule matching, cache persistence and
//! server refresh.

mod store;
mod types;

pub use store::PolicyStore;
pub use types::{default_policy, normalize_path, Policy};

#[derive(Debug)]
pub enum PolicyError {
    /// Cache file unreadable or policy state unusable.
    Load(String),
    /// Server fetch failed; the previous policy stays in effect.
    Network(String),
    /// A downloaded or cached document did not parse.
    Parse(String),
    /// Admin mutation rejected: the item is already present.
    AlreadyExists(String),
    /// Admin mutation rejected: the item is not present.
    NotFound(String),
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::Load(e) => write!(f, "policy load error: {}", e),
            PolicyError::Network(e) => write!(f, "policy network error: {}", e),
            PolicyError::Parse(e) => write!(f, "policy parse error: {}", e),
            PolicyError::AlreadyExists(item) => write!(f, "item already present: {}", item),
            PolicyError::NotFound(item) => write!(f, "item not found: {}", item),
        }
    }
}

impl std::error::Error for PolicyError {}
