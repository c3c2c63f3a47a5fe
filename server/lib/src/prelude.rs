pub use std::collections::{BTreeMap, BTreeSet};
pub use std::sync::Arc;
pub use std::time::Duration;

pub use url::Url;
pub use uuid::Uuid;

pub use ianus_proto::constants::*;
pub use ianus_proto::internal::OperationError;

pub use crate::config::AuthzConfig;
