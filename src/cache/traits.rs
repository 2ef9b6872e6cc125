use async_trait::async_trait;
use std::time::Duration;

/// One command in a pipelined cache round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheCommand {
    /// Set a string value with a time-to-live
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    /// Upsert a member's coordinates in a geospatial index
    GeoAdd {
        key: String,
        member: String,
        longitude: f64,
        latitude: f64,
    },
    /// Add a member to a set
    SAdd { key: String, member: String },
}

/// Commands sent to the cache together in a single round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachePipeline {
    commands: Vec<CacheCommand>,
}

impl CachePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ex(&mut self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> &mut Self {
        self.commands.push(CacheCommand::SetEx {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    pub fn geo_add(
        &mut self,
        key: impl Into<String>,
        member: impl Into<String>,
        longitude: f64,
        latitude: f64,
    ) -> &mut Self {
        self.commands.push(CacheCommand::GeoAdd {
            key: key.into(),
            member: member.into(),
            longitude,
            latitude,
        });
        self
    }

    pub fn sadd(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.commands.push(CacheCommand::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[CacheCommand] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<CacheCommand> {
        self.commands
    }
}

/// Shared cache holding the freshest driver state.
///
/// The pipeline is the only writer of the keys it produces; readers use
/// the accessor methods.
#[async_trait]
pub trait LocationCache: Send + Sync {
    /// Execute every command in one round trip.
    async fn execute(&self, pipeline: CachePipeline) -> Result<(), CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError>;

    /// Members of a geospatial index with their `(longitude, latitude)`.
    async fn geo_members(&self, key: &str) -> Result<Vec<(String, f64, f64)>, CacheError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("invalid geo coordinates for member {member}: ({longitude}, {latitude})")]
    InvalidCoordinates {
        member: String,
        longitude: f64,
        latitude: f64,
    },

    #[error("failed to encode cache value: {0}")]
    Encode(#[from] serde_json::Error),
}
