use url::Url;

use crate::types::{CoreError, Result};

/// Derives request URLs from a fixed base by appending a path segment and/or
/// query parameters. The base query and fragment are preserved.
#[derive(Debug, Clone)]
pub struct UrlBuilder {
    base: Url,
}

impl UrlBuilder {
    pub fn new(base: &str) -> Result<Self> {
        let base = base.trim();
        if base.is_empty() {
            return Err(CoreError::invalid("base URL cannot be blank"));
        }
        let base = Url::parse(base)?;
        if base.cannot_be_a_base() {
            return Err(CoreError::invalid(format!(
                "URL cannot be used as a base: {}",
                base
            )));
        }
        Ok(Self { base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Appends `segment` to the base path and `params` to the base query.
    ///
    /// `segment` may itself carry a query (merged after the base query) and a
    /// fragment (discarded). Empty path components are collapsed.
    pub fn build(&self, segment: Option<&str>, params: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        let segment = segment.map(str::trim).unwrap_or_default();
        let segment = segment.split('#').next().unwrap_or_default();
        let (path, extra_query) = match segment.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (segment, None),
        };

        if !path.is_empty() {
            if let Ok(mut segments) = url.path_segments_mut() {
                segments
                    .pop_if_empty()
                    .extend(path.split('/').filter(|s| !s.is_empty()));
            }
        }

        let extra: Vec<(String, String)> = extra_query
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        if !extra.is_empty() || !params.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(extra.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .extend_pairs(params.iter().copied());
        }
        url
    }

    /// Appends `segment` as a single literal path component.
    pub fn join_segment(&self, segment: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(segment);
        }
        url
    }
}
