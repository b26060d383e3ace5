use crate::domain::{DomainError, RemoteFaceCreate, RemotePerson, TargetApi};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Per-call timeout; a timed-out call is an item-level error upstream.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct PersonDto {
    id: String,
    #[serde(default)]
    name: String,
}

/// TargetApi over the Immich HTTP API, authenticated with an x-api-key
/// header.
pub struct ImmichClient {
    client: Client,
    base_url: String,
}

impl ImmichClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, DomainError> {
        let mut headers = header::HeaderMap::new();
        let key_value = header::HeaderValue::from_str(api_key)
            .map_err(|_| DomainError::Configuration("API key contains invalid characters".into()))?;
        headers.insert("x-api-key", key_value);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DomainError::Configuration(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn check_status(res: reqwest::Response, what: &str) -> Result<reqwest::Response, DomainError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(DomainError::NotFound(format!("{}: {}", what, body)));
    }
    Err(DomainError::Network(format!(
        "{} failed with status {}: {}",
        what, status, body
    )))
}

#[async_trait]
impl TargetApi for ImmichClient {
    async fn ping(&self) -> Result<(), DomainError> {
        let res = self.client.get(self.url("/api/server/ping")).send().await?;
        check_status(res, "ping").await?;
        Ok(())
    }

    async fn get_person(&self, person_id: &str) -> Result<Option<RemotePerson>, DomainError> {
        let res = self
            .client
            .get(self.url(&format!("/api/people/{}", person_id)))
            .send()
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let res = check_status(res, "get person").await?;
        let dto: PersonDto = res.json().await?;
        Ok(Some(RemotePerson {
            id: dto.id,
            name: dto.name,
        }))
    }

    async fn find_person_by_name(&self, name: &str) -> Result<Option<RemotePerson>, DomainError> {
        let res = self
            .client
            .get(self.url("/api/search/person"))
            .query(&[("name", name), ("withHidden", "true")])
            .send()
            .await?;
        let res = check_status(res, "search person").await?;
        let dtos: Vec<PersonDto> = res.json().await?;
        // The search endpoint is fuzzy; only an exact (folded) name counts.
        let folded = crate::domain::fold_person_name(name);
        Ok(dtos
            .into_iter()
            .find(|p| crate::domain::fold_person_name(&p.name) == folded)
            .map(|p| RemotePerson {
                id: p.id,
                name: p.name,
            }))
    }

    async fn create_person(&self, name: &str) -> Result<RemotePerson, DomainError> {
        let res = self
            .client
            .post(self.url("/api/people"))
            .json(&json!({ "name": name }))
            .send()
            .await?;
        let res = check_status(res, "create person").await?;
        let dto: PersonDto = res.json().await?;
        Ok(RemotePerson {
            id: dto.id,
            name: dto.name,
        })
    }

    async fn rename_person(&self, person_id: &str, name: &str) -> Result<(), DomainError> {
        let res = self
            .client
            .put(self.url(&format!("/api/people/{}", person_id)))
            .json(&json!({ "name": name }))
            .send()
            .await?;
        check_status(res, "rename person").await?;
        Ok(())
    }

    async fn reassign_face(&self, face_id: &str, person_id: &str) -> Result<(), DomainError> {
        let res = self
            .client
            .put(self.url(&format!("/api/faces/{}", face_id)))
            .json(&json!({ "id": person_id }))
            .send()
            .await?;
        check_status(res, "reassign face").await?;
        Ok(())
    }

    async fn create_face(&self, face: &RemoteFaceCreate) -> Result<(), DomainError> {
        let res = self
            .client
            .post(self.url("/api/faces"))
            .json(&json!({
                "assetId": face.asset_id,
                "personId": face.person_id,
                "imageWidth": face.image_width,
                "imageHeight": face.image_height,
                "x": face.x,
                "y": face.y,
                "width": face.width,
                "height": face.height,
            }))
            .send()
            .await?;
        check_status(res, "create face").await?;
        Ok(())
    }
}
