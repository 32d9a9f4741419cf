//! Translation of upstream-reported file paths into locally accessible ones.
//!
//! The metadata service reports paths as seen from its own filesystem. When
//! this service runs elsewhere (a different container, an NFS mount), a
//! configured prefix table maps them onto local paths. Longest prefix wins.

use std::path::PathBuf;

use crate::config::PathMapping;
use crate::errors::StreamError;

pub struct PathMapper {
    /// Sorted longest-prefix-first so the first match wins.
    mappings: Vec<(String, String)>,
}

impl PathMapper {
    pub fn new(mappings: &[PathMapping]) -> Self {
        let mut mappings: Vec<(String, String)> = mappings
            .iter()
            .map(|m| (m.from.clone(), m.to.clone()))
            .collect();
        mappings.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { mappings }
    }

    /// Translate an upstream path. With an empty table the path is used as
    /// reported; with a non-empty table an unmatched path is an error rather
    /// than a silent passthrough.
    pub fn translate(&self, external: &str) -> Result<PathBuf, StreamError> {
        if self.mappings.is_empty() {
            return Ok(PathBuf::from(external));
        }
        for (from, to) in &self.mappings {
            if let Some(rest) = external.strip_prefix(from.as_str()) {
                let rest = rest.trim_start_matches('/');
                let mut mapped = PathBuf::from(to);
                if !rest.is_empty() {
                    mapped.push(rest);
                }
                return Ok(mapped);
            }
        }
        Err(StreamError::PathNotMapped {
            path: external.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(pairs: &[(&str, &str)]) -> PathMapper {
        let mappings: Vec<PathMapping> = pairs
            .iter()
            .map(|(from, to)| PathMapping {
                from: from.to_string(),
                to: to.to_string(),
            })
            .collect();
        PathMapper::new(&mappings)
    }

    #[test]
    fn empty_table_is_identity() {
        let m = mapper(&[]);
        assert_eq!(
            m.translate("/data/video.mp4").unwrap(),
            PathBuf::from("/data/video.mp4")
        );
    }

    #[test]
    fn longest_prefix_wins() {
        let m = mapper(&[("/media", "/mnt/a"), ("/media/archive", "/mnt/b")]);
        assert_eq!(
            m.translate("/media/archive/x.mp4").unwrap(),
            PathBuf::from("/mnt/b/x.mp4")
        );
        assert_eq!(
            m.translate("/media/y.mp4").unwrap(),
            PathBuf::from("/mnt/a/y.mp4")
        );
    }

    #[test]
    fn unmatched_path_is_an_error() {
        let m = mapper(&[("/media", "/mnt/a")]);
        assert!(matches!(
            m.translate("/elsewhere/z.mp4"),
            Err(StreamError::PathNotMapped { .. })
        ));
    }
}
