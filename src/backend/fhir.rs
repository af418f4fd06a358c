//! FHIR REST backend.
//!
//! Creates rest-hook `Subscription` resources on a FHIR server. The
//! resource layout differs between FHIR releases:
//! - DSTU2 carries the tracking tag in `Subscription.tag` and uses the
//!   legacy `application/json+fhir` MIME names
//! - STU3 and R4 carry it in `meta.tag` and use `application/fhir+json`

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Map, Value};

use super::{BackendError, RemoteHandle, SubscriptionBackend, SubscriptionRequest, TrackingTag};
use crate::payload::PayloadType;

/// FHIR release spoken by the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum FhirVersion {
    Dstu2,
    Stu3,
    #[default]
    R4,
}

impl FhirVersion {
    /// MIME type for resource bodies exchanged with the server.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Dstu2 => "application/json+fhir",
            Self::Stu3 | Self::R4 => "application/fhir+json",
        }
    }

    /// MIME type advertised in `channel.payload` for a payload type.
    pub fn payload_mime(self, payload_type: PayloadType) -> Option<&'static str> {
        match (self, payload_type) {
            (Self::Dstu2, PayloadType::Xml) => Some("application/xml+fhir"),
            (Self::Dstu2, PayloadType::Json) => Some("application/json+fhir"),
            _ => payload_type.mime_type(),
        }
    }

    /// Build the `Subscription` resource for a request.
    pub fn subscription_resource(self, request: &SubscriptionRequest) -> Value {
        let mut channel = Map::new();
        channel.insert("type".into(), json!("rest-hook"));
        channel.insert("endpoint".into(), json!(request.endpoint));
        if let Some(mime) = self.payload_mime(request.payload_type) {
            channel.insert("payload".into(), json!(mime));
        }

        let tag = json!([{ "system": request.tag.system, "code": request.tag.code }]);

        let mut resource = json!({
            "resourceType": "Subscription",
            "criteria": request.criteria,
            "reason": request.reason,
            "status": "requested",
            "channel": Value::Object(channel),
        });

        match self {
            Self::Dstu2 => resource["tag"] = tag,
            Self::Stu3 | Self::R4 => resource["meta"] = json!({ "tag": tag }),
        }

        resource
    }
}

/// Backend creating subscriptions on a FHIR server over REST.
#[derive(Clone, Debug)]
pub struct FhirRestBackend {
    client: Client,
    base_url: String,
    version: FhirVersion,
}

impl FhirRestBackend {
    /// Create a backend for the server at `base_url`.
    ///
    /// # Arguments
    ///
    /// * `base_url` - FHIR service base, e.g. `https://fhir.example.org/r4`
    /// * `version` - FHIR release spoken by the server
    /// * `timeout` - Timeout applied to every request
    pub fn new(
        base_url: &str,
        version: FhirVersion,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            version,
        })
    }

    /// Get the FHIR release this backend speaks.
    pub fn version(&self) -> FhirVersion {
        self.version
    }

    fn subscription_url(&self) -> String {
        format!("{}/Subscription", self.base_url)
    }

    /// Find the ids of every subscription carrying the tag, following the
    /// search Bundle's `next` links until the last page.
    async fn search_by_tag(&self, tag: &TrackingTag) -> Result<Vec<String>, BackendError> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut request = self
            .client
            .get(self.subscription_url())
            .query(&[("_tag", tag.token()), ("_elements", "id".to_string())]);

        loop {
            let response = request
                .header(ACCEPT, self.version.content_type())
                .send()
                .await?;
            let bundle: Value = check_status(response).await?.json().await?;
            ids.extend(bundle_ids(&bundle));

            match next_link(&bundle) {
                // Stop on a repeated page link.
                Some(next) if seen.insert(next.clone()) => request = self.client.get(next),
                _ => break,
            }
        }

        Ok(ids)
    }
}

#[async_trait]
impl SubscriptionBackend for FhirRestBackend {
    #[tracing::instrument(skip(self, request), fields(criteria = %request.criteria))]
    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<RemoteHandle, BackendError> {
        let resource = self.version.subscription_resource(request);

        let response = self
            .client
            .post(self.subscription_url())
            .header(CONTENT_TYPE, self.version.content_type())
            .header(ACCEPT, self.version.content_type())
            .header("Prefer", "return=representation")
            .body(resource.to_string())
            .send()
            .await?;
        let response = check_status(response).await?;

        let location_id = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .and_then(id_from_location);

        // Servers honouring `Prefer: return=minimal` send no body.
        let body = response.text().await?;
        let body_id = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|created| created.get("id").and_then(Value::as_str).map(str::to_string));

        let id = body_id.or(location_id).ok_or(BackendError::MissingId)?;
        tracing::debug!(remote_id = %id, "Created remote subscription");

        Ok(RemoteHandle::new(id))
    }

    #[tracing::instrument(skip(self, handle), fields(remote_id = %handle))]
    async fn delete_subscription(&self, handle: &RemoteHandle) -> Result<(), BackendError> {
        let response = self
            .client
            .delete(format!("{}/{}", self.subscription_url(), handle.as_str()))
            .header(ACCEPT, self.version.content_type())
            .send()
            .await?;

        // Already gone on the server: nothing left to revoke.
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::GONE) {
            tracing::debug!("Remote subscription already deleted");
            return Ok(());
        }

        check_status(response).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, tag), fields(tag = %tag.token()))]
    async fn delete_all_by_tag(&self, tag: &TrackingTag) -> Result<(), BackendError> {
        let response = self
            .client
            .delete(self.subscription_url())
            .header(ACCEPT, self.version.content_type())
            .query(&[("_tag", tag.token())])
            .send()
            .await?;

        // Servers without multiple-match conditional delete answer 412;
        // fall back to search and delete one by one.
        if response.status() == StatusCode::PRECONDITION_FAILED {
            let ids = self.search_by_tag(tag).await?;
            tracing::debug!(count = ids.len(), "Deleting tagged subscriptions individually");
            let mut first_error = None;
            for id in ids {
                if let Err(e) = self.delete_subscription(&RemoteHandle::new(id.clone())).await {
                    tracing::warn!(%id, error = %e, "Failed to delete tagged subscription");
                    first_error.get_or_insert(e);
                }
            }
            return first_error.map_or(Ok(()), Err);
        }

        check_status(response).await?;
        Ok(())
    }
}

/// Turn a non-success response into a [`BackendError::Status`].
async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Extract the logical id from a `Location` such as
/// `https://server/fhir/Subscription/42/_history/1`.
fn id_from_location(location: &str) -> Option<String> {
    let (_, rest) = location.rsplit_once("Subscription/")?;
    let id = rest.split('/').next()?;
    (!id.is_empty()).then(|| id.to_string())
}

/// Logical ids of the resources in one search Bundle page.
fn bundle_ids(bundle: &Value) -> impl Iterator<Item = String> + '_ {
    bundle
        .get("entry")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.pointer("/resource/id").and_then(Value::as_str))
        .map(str::to_string)
}

/// The absolute URL of the next Bundle page, if any.
fn next_link(bundle: &Value) -> Option<String> {
    bundle
        .get("link")?
        .as_array()?
        .iter()
        .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))?
        .get("url")?
        .as_str()
        .map(str::to_string)
}
