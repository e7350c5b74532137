//! Declarative downstream resources
//!
//! A [`ResourceSpec`] describes how one service lists and deletes a user's
//! resources; [`ResourceSource`] turns it into a [`BatchSource`].

use async_trait::async_trait;
use serde_json::Value;

use um_identity::ImpersonationToken;

use crate::batch::{Batch, BatchCursor, BatchSource};
use crate::client::DownstreamClient;
use crate::error::{CleanupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// `?limit=N&offset=K`, optionally with `show_hidden=true`
    Paged { show_hidden: bool },
    /// `?limit=0&offset=0`, which the service answers with the whole set
    All,
    /// No query at all
    Unpaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListShape {
    /// The body is the array
    Array,
    /// The array sits under this field of a JSON object
    Field(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Everything listed belongs to the user
    Any,
    /// Only entries whose owner field equals the user are deleted
    OwnedBySubject { owner_field: &'static str },
    /// Public entries owned by other users survive; the rest is deleted
    KeepPublicOfOthers {
        public_field: &'static str,
        owner_field: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// `DELETE {base}/{path}/{id}` per id
    EachById { path: &'static str },
    /// `DELETE {base}/{path}` with a JSON array of ids
    BatchBody { path: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSpec {
    pub name: &'static str,
    pub list_path: &'static str,
    pub pagination: Pagination,
    pub shape: ListShape,
    pub id_field: &'static str,
    pub ownership: Ownership,
    pub delete: DeleteMode,
}

pub struct ResourceSource {
    spec: ResourceSpec,
    base_url: String,
    client: DownstreamClient,
}

impl ResourceSource {
    pub fn new(spec: ResourceSpec, base_url: impl Into<String>, client: DownstreamClient) -> Self {
        Self {
            spec,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn spec(&self) -> &ResourceSpec {
        &self.spec
    }

    pub fn list_url(&self, cursor: BatchCursor) -> String {
        let base = format!("{}/{}", self.base_url, self.spec.list_path);
        match self.spec.pagination {
            Pagination::Paged { show_hidden } => {
                let mut url = format!("{}?limit={}&offset={}", base, cursor.limit, cursor.offset);
                if show_hidden {
                    url.push_str("&show_hidden=true");
                }
                url
            }
            Pagination::All => format!("{}?limit=0&offset=0", base),
            Pagination::Unpaged => base,
        }
    }

    fn entries<'a>(&self, url: &str, body: &'a Value) -> Result<&'a [Value]> {
        let list = match self.spec.shape {
            ListShape::Array => Some(body),
            ListShape::Field(field) => body.get(field),
        };
        match list {
            Some(Value::Array(entries)) => Ok(entries.as_slice()),
            // Services answer an empty collection with null or a missing field
            Some(Value::Null) | None => Ok(&[]),
            Some(_) => Err(CleanupError::InvalidResponse {
                url: url.to_string(),
                reason: "expected a JSON array of resources".to_string(),
            }),
        }
    }

    fn id_of(&self, url: &str, entry: &Value) -> Result<String> {
        entry
            .get(self.spec.id_field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CleanupError::InvalidResponse {
                url: url.to_string(),
                reason: format!("resource without string field '{}'", self.spec.id_field),
            })
    }

    fn removable(&self, entry: &Value, subject: &str) -> bool {
        let owner_is_subject =
            |field: &str| entry.get(field).and_then(Value::as_str) == Some(subject);

        match self.spec.ownership {
            Ownership::Any => true,
            Ownership::OwnedBySubject { owner_field } => owner_is_subject(owner_field),
            Ownership::KeepPublicOfOthers {
                public_field,
                owner_field,
            } => {
                let public = entry
                    .get(public_field)
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                !public || owner_is_subject(owner_field)
            }
        }
    }
}

#[async_trait]
impl BatchSource for ResourceSource {
    fn paged(&self) -> bool {
        matches!(self.spec.pagination, Pagination::Paged { .. })
    }

    async fn list(&self, token: &ImpersonationToken, cursor: BatchCursor) -> Result<Batch> {
        let url = self.list_url(cursor);
        let body = self.client.get_json(token, &url).await?;

        let mut batch = Batch::default();
        for entry in self.entries(&url, &body)? {
            if self.removable(entry, token.subject_user_id()) {
                batch.removable.push(self.id_of(&url, entry)?);
            } else {
                batch.retained += 1;
            }
        }
        Ok(batch)
    }

    async fn delete(&self, token: &ImpersonationToken, ids: &[String]) -> Result<()> {
        match self.spec.delete {
            DeleteMode::EachById { path } => {
                for id in ids {
                    let url = format!("{}/{}/{}", self.base_url, path, urlencoding::encode(id));
                    self.client.delete(token, &url).await?;
                }
                Ok(())
            }
            DeleteMode::BatchBody { path } => {
                let url = format!("{}/{}", self.base_url, path);
                self.client.delete_ids(token, &url, ids).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn source(spec: ResourceSpec) -> ResourceSource {
        let client = DownstreamClient::with_client(reqwest::Client::new(), 1, Duration::ZERO);
        ResourceSource::new(spec, "http://svc/", client)
    }

    fn spec(pagination: Pagination, ownership: Ownership) -> ResourceSpec {
        ResourceSpec {
            name: "things",
            list_path: "things",
            pagination,
            shape: ListShape::Field("things"),
            id_field: "id",
            ownership,
            delete: DeleteMode::EachById { path: "things" },
        }
    }

    #[test]
    fn test_list_urls() {
        let cursor = BatchCursor {
            limit: 50,
            offset: 7,
        };

        let paged = source(spec(Pagination::Paged { show_hidden: true }, Ownership::Any));
        assert_eq!(
            paged.list_url(cursor),
            "http://svc/things?limit=50&offset=7&show_hidden=true"
        );

        let all = source(spec(Pagination::All, Ownership::Any));
        assert_eq!(all.list_url(cursor), "http://svc/things?limit=0&offset=0");

        let unpaged = source(spec(Pagination::Unpaged, Ownership::Any));
        assert_eq!(unpaged.list_url(cursor), "http://svc/things");
    }

    #[test]
    fn test_owned_by_subject() {
        let s = source(spec(
            Pagination::All,
            Ownership::OwnedBySubject {
                owner_field: "userId",
            },
        ));
        assert!(s.removable(&serde_json::json!({"userId": "me"}), "me"));
        assert!(!s.removable(&serde_json::json!({"userId": "other", "pub": true}), "me"));
        assert!(!s.removable(&serde_json::json!({}), "me"));
    }

    #[test]
    fn test_keep_public_of_others() {
        let s = source(spec(
            Pagination::Paged { show_hidden: false },
            Ownership::KeepPublicOfOthers {
                public_field: "Public",
                owner_field: "UserId",
            },
        ));
        assert!(s.removable(&serde_json::json!({"Public": false, "UserId": "me"}), "me"));
        assert!(s.removable(&serde_json::json!({"Public": true, "UserId": "me"}), "me"));
        assert!(!s.removable(&serde_json::json!({"Public": true, "UserId": "other"}), "me"));
    }

    #[test]
    fn test_entries_tolerate_null() {
        let s = source(spec(Pagination::All, Ownership::Any));
        let body = serde_json::json!({"things": null});
        assert!(s.entries("u", &body).unwrap().is_empty());

        let bad = serde_json::json!({"things": "nope"});
        assert!(s.entries("u", &bad).is_err());
    }
}
