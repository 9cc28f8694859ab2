//! Conversion webhook between the DocumentDB API versions.
//!
//! The apiserver posts an `apiextensions.k8s.io/v1` ConversionReview to
//! `/convert` whenever an object stored as `preview` is served as `v1alpha1`
//! or vice versa. Hand-carried wire types, like the other external contracts
//! in this crate. Downgrades are lossy: fields that do not survive are
//! recorded in the `documentdb.io/converted-lost-fields` annotation instead
//! of being dropped silently.

use crate::apis::{documentdb_types as preview, v1alpha1};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PREVIEW_API_VERSION: &str = "documentdb.io/preview";
pub const V1ALPHA1_API_VERSION: &str = "documentdb.io/v1alpha1";

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ConversionReview {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ConversionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ConversionResponse>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ConversionRequest {
    pub uid: String,
    #[serde(rename = "desiredAPIVersion")]
    pub desired_api_version: String,
    pub objects: Vec<Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ConversionResponse {
    pub uid: String,
    #[serde(
        rename = "convertedObjects",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub converted_objects: Option<Vec<Value>>,
    pub result: ConversionResult,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ConversionResult {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn respond(review: &ConversionReview, response: ConversionResponse) -> ConversionReview {
    ConversionReview {
        api_version: review.api_version.clone(),
        kind: review.kind.clone(),
        request: None,
        response: Some(response),
    }
}

/// Handle one ConversionReview: convert every object or fail the whole batch,
/// as the conversion contract requires.
pub fn convert_review(review: ConversionReview) -> ConversionReview {
    let Some(request) = review.request.clone() else {
        return respond(
            &review,
            ConversionResponse {
                uid: String::new(),
                converted_objects: None,
                result: ConversionResult {
                    status: "Failed".to_string(),
                    message: Some("conversion review carries no request".to_string()),
                },
            },
        );
    };

    let mut converted = Vec::with_capacity(request.objects.len());
    for object in request.objects {
        match convert_object(object, &request.desired_api_version) {
            Ok(object) => converted.push(object),
            Err(message) => {
                return respond(
                    &review,
                    ConversionResponse {
                        uid: request.uid,
                        converted_objects: None,
                        result: ConversionResult {
                            status: "Failed".to_string(),
                            message: Some(message),
                        },
                    },
                )
            }
        }
    }

    respond(
        &review,
        ConversionResponse {
            uid: request.uid,
            converted_objects: Some(converted),
            result: ConversionResult {
                status: "Success".to_string(),
                message: None,
            },
        },
    )
}

/// Convert a single object to the desired apiVersion. Only `apiVersion`,
/// `spec`, and (on lossy downgrade) the lost-fields annotation are touched;
/// metadata and status pass through.
pub fn convert_object(mut object: Value, desired_api_version: &str) -> Result<Value, String> {
    let current = object
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| "object has no apiVersion".to_string())?
        .to_string();
    if current == desired_api_version {
        return Ok(object);
    }

    let spec_value = object.get("spec").cloned().unwrap_or_else(|| json!({}));
    match (current.as_str(), desired_api_version) {
        (V1ALPHA1_API_VERSION, PREVIEW_API_VERSION) => {
            let old: v1alpha1::DocumentDBSpec = serde_json::from_value(spec_value)
                .map_err(|e| format!("invalid v1alpha1 spec: {}", e))?;
            let upgraded: preview::DocumentDBSpec = old.into();
            object["spec"] =
                serde_json::to_value(upgraded).map_err(|e| format!("serialize spec: {}", e))?;
            object["apiVersion"] = json!(desired_api_version);
            Ok(object)
        }
        (PREVIEW_API_VERSION, V1ALPHA1_API_VERSION) => {
            let hub: preview::DocumentDBSpec = serde_json::from_value(spec_value)
                .map_err(|e| format!("invalid preview spec: {}", e))?;
            let (downgraded, lost) = v1alpha1::downgrade(hub);
            object["spec"] =
                serde_json::to_value(downgraded).map_err(|e| format!("serialize spec: {}", e))?;
            object["apiVersion"] = json!(desired_api_version);
            if !lost.is_empty() {
                object["metadata"]["annotations"][v1alpha1::LOST_FIELDS_ANNOTATION] =
                    json!(lost.join(","));
            }
            Ok(object)
        }
        (from, to) => Err(format!("unsupported conversion from {} to {}", from, to)),
    }
}
