use super::traits::{CacheCommand, CacheError, CachePipeline, LocationCache};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// In-process cache backend with TTL strings, geo indexes and sets.
#[derive(Default)]
pub struct MemoryCache {
    strings: DashMap<String, (String, Instant)>,
    geo: DashMap<String, HashMap<String, (f64, f64)>>,
    sets: DashMap<String, HashSet<String>>,
    round_trips: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `execute` calls served so far.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    /// Remaining time-to-live of a live string key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entry = self.strings.get(key)?;
        entry.1.checked_duration_since(Instant::now())
    }

    fn apply(&self, command: CacheCommand) {
        match command {
            CacheCommand::SetEx { key, value, ttl } => {
                self.strings.insert(key, (value, Instant::now() + ttl));
            }
            CacheCommand::GeoAdd {
                key,
                member,
                longitude,
                latitude,
            } => {
                self.geo
                    .entry(key)
                    .or_default()
                    .insert(member, (longitude, latitude));
            }
            CacheCommand::SAdd { key, member } => {
                self.sets.entry(key).or_default().insert(member);
            }
        }
    }
}

#[async_trait]
impl LocationCache for MemoryCache {
    async fn execute(&self, pipeline: CachePipeline) -> Result<(), CacheError> {
        self.round_trips.fetch_add(1, Ordering::Relaxed);

        // Reject the whole round trip before touching any key
        for command in pipeline.commands() {
            if let CacheCommand::GeoAdd {
                member,
                longitude,
                latitude,
                ..
            } = command
            {
                if !longitude.is_finite() || !latitude.is_finite() {
                    return Err(CacheError::InvalidCoordinates {
                        member: member.clone(),
                        longitude: *longitude,
                        latitude: *latitude,
                    });
                }
            }
        }

        for command in pipeline.into_commands() {
            self.apply(command);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let expired = match self.strings.get(key) {
            Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.strings.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        Ok(None)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let mut members: Vec<String> = self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn geo_members(&self, key: &str) -> Result<Vec<(String, f64, f64)>, CacheError> {
        let mut members: Vec<(String, f64, f64)> = self
            .geo
            .get(key)
            .map(|index| {
                index
                    .iter()
                    .map(|(member, (lon, lat))| (member.clone(), *lon, *lat))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipeline_applies_all_commands_in_one_round_trip() {
        let cache = MemoryCache::new();
        let mut pipeline = CachePipeline::new();
        pipeline
            .set_ex("driver:location:d1", "{}", Duration::from_secs(3600))
            .geo_add("region:drivers:nyc", "d1", -74.0, 40.7)
            .sadd("status:online", "d1");
        assert_eq!(pipeline.len(), 3);

        cache.execute(pipeline).await.unwrap();

        assert_eq!(cache.round_trips(), 1);
        assert_eq!(cache.get("driver:location:d1").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(
            cache.geo_members("region:drivers:nyc").await.unwrap(),
            vec![("d1".to_string(), -74.0, 40.7)]
        );
        assert_eq!(cache.smembers("status:online").await.unwrap(), vec!["d1"]);
        assert!(cache.ttl("driver:location:d1").unwrap() > Duration::from_secs(3500));
    }

    #[tokio::test]
    async fn test_geo_add_overwrites_member() {
        let cache = MemoryCache::new();
        let mut first = CachePipeline::new();
        first.geo_add("region:drivers:nyc", "d1", 1.0, 1.0);
        cache.execute(first).await.unwrap();

        let mut second = CachePipeline::new();
        second.geo_add("region:drivers:nyc", "d1", 2.0, 2.0);
        cache.execute(second).await.unwrap();

        let members = cache.geo_members("region:drivers:nyc").await.unwrap();
        assert_eq!(members, vec![("d1".to_string(), 2.0, 2.0)]);
    }

    #[tokio::test]
    async fn test_expired_keys_disappear() {
        let cache = MemoryCache::new();
        let mut pipeline = CachePipeline::new();
        pipeline.set_ex("k", "v", Duration::from_millis(10));
        cache.execute(pipeline).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.ttl("k"), None);
    }

    #[tokio::test]
    async fn test_invalid_coordinates_reject_whole_pipeline() {
        let cache = MemoryCache::new();
        let mut pipeline = CachePipeline::new();
        pipeline
            .sadd("status:online", "d1")
            .geo_add("region:drivers:nyc", "d1", f64::NAN, 0.0);

        assert!(matches!(
            cache.execute(pipeline).await,
            Err(CacheError::InvalidCoordinates { .. })
        ));
        assert!(cache.smembers("status:online").await.unwrap().is_empty());
    }
}
