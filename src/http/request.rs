//! Request context: identity material, query string and JSON body of one
//! request, read once up front

use bytes::Bytes;
use hyper::{header, HeaderMap, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::attachments::AttachmentUpload;
use crate::error::CivicError;
use crate::identity::{Credentials, DeviceIdSources};
use crate::services::notification_service::PushDeviceInput;
use crate::services::Caller;

/// Header names that may carry the device identifier, in precedence order
const DEVICE_ID_HEADERS: [&str; 3] = ["device-id", "x-device-id", "device_id"];

const PUSH_TOKEN_HEADER: &str = "x-push-token";
const PUSH_PLATFORM_HEADER: &str = "x-push-platform";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    query: String,
    headers: HeaderMap,
    body: Bytes,
    pub credentials: Option<Credentials>,
    pub device_id: Option<String>,
}

/// Optional base64 uploads riding along in a JSON body
#[derive(Debug, Default, Deserialize)]
pub struct Uploads {
    #[serde(default)]
    pub attachment: Option<AttachmentUpload>,
    #[serde(default)]
    pub image: Option<AttachmentUpload>,
    #[serde(default)]
    pub video: Option<AttachmentUpload>,
}

#[derive(Deserialize)]
struct BodyDevice {
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Deserialize)]
struct QueryDevice {
    #[serde(default)]
    device_id: Option<String>,
}

impl RequestContext {
    pub fn new(method: Method, path: String, query: Option<&str>, headers: HeaderMap, body: Bytes) -> Self {
        let query = query.unwrap_or_default().to_string();

        let credentials = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(Credentials::from_authorization);

        let header_device = DEVICE_ID_HEADERS
            .iter()
            .filter_map(|name| headers.get(*name))
            .filter_map(|v| v.to_str().ok())
            .find(|v| !v.trim().is_empty())
            .map(str::to_string);
        let body_device = serde_json::from_slice::<BodyDevice>(&body)
            .ok()
            .and_then(|b| b.device_id);
        let query_device = serde_urlencoded::from_str::<QueryDevice>(&query)
            .ok()
            .and_then(|q| q.device_id);

        let device_id = DeviceIdSources {
            header: header_device.as_deref(),
            body: body_device.as_deref(),
            query: query_device.as_deref(),
        }
        .pick()
        .map(|d| d.trim().to_string());

        Self {
            method,
            path,
            query,
            headers,
            body,
            credentials,
            device_id,
        }
    }

    pub fn caller(&self) -> Caller<'_> {
        Caller {
            credentials: self.credentials.as_ref(),
            device_id: self.device_id.as_deref(),
        }
    }

    /// Deserialize the query string
    pub fn query<T: DeserializeOwned>(&self) -> Result<T, CivicError> {
        serde_urlencoded::from_str(&self.query)
            .map_err(|e| CivicError::InvalidInput(format!("Invalid query string: {}", e)))
    }

    /// Deserialize the JSON body. An empty body reads as `{}`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, CivicError> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::from_str("{}")?);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn uploads(&self) -> Result<Uploads, CivicError> {
        self.json()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Push device announced through headers, if any
    pub fn push_registration(&self) -> Option<PushDeviceInput> {
        let token = self.header(PUSH_TOKEN_HEADER)?;
        Some(PushDeviceInput {
            token: token.to_string(),
            platform: self.header(PUSH_PLATFORM_HEADER).unwrap_or("android").to_string(),
        })
    }
}
