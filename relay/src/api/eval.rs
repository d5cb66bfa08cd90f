use super::utils::{
    empty_response, error_json_response, json_response, text_response, HandlerBody,
};
use crate::environment::Environment;
use crate::evaluate;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use bytes::Bytes;
use hyper::{Response, StatusCode};

/// Where the user document comes from: the URL path for `GET`, the request
/// body for `REPORT`.
pub enum UserSource<'a> {
    Path(&'a str),
    Body {
        content_type: Option<&'a str>,
        body: &'a Bytes,
    },
}

/// Evaluates every flag for the supplied user and writes the resulting
/// `flag key → value` map as JSON.
pub async fn evaluate_all_flags(
    environment: &Environment,
    source: UserSource<'_>,
) -> Response<HandlerBody> {
    let user_json = match decode_user(source) {
        Ok(value) => value,
        Err(response) => return response,
    };

    if user_json.get("key").map_or(true, |key| key.is_null()) {
        return error_json_response(StatusCode::BAD_REQUEST, "User must have a 'key' attribute");
    }

    let context = match evaluate::context_from_json(user_json) {
        Ok(context) => context,
        Err(detail) => return error_json_response(StatusCode::BAD_REQUEST, &detail),
    };

    match environment.all_flags(&context).await {
        Ok(values) => json_response(StatusCode::OK, &values),
        Err(err) => {
            tracing::error!(
                environment = environment.name(),
                error = %err,
                "failed to read flags for evaluation"
            );
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn decode_user(source: UserSource<'_>) -> Result<serde_json::Value, Response<HandlerBody>> {
    match source {
        UserSource::Path(encoded) => {
            let bytes = base64url_decode(encoded).ok_or_else(|| {
                error_json_response(
                    StatusCode::BAD_REQUEST,
                    "User part of url path did not decode as valid base64",
                )
            })?;
            serde_json::from_slice(&bytes).map_err(|_| {
                error_json_response(
                    StatusCode::BAD_REQUEST,
                    "User part of url path did not decode to valid user as json",
                )
            })
        }
        UserSource::Body { content_type, body } => {
            if content_type != Some("application/json") {
                return Err(text_response(
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    "Content-Type must be application/json.",
                ));
            }
            serde_json::from_slice(body)
                .map_err(|e| error_json_response(StatusCode::BAD_REQUEST, &e.to_string()))
        }
    }
}

/// Padded form first, then raw unpadded, mirroring how SDKs encode users.
fn base64url_decode(encoded: &str) -> Option<Vec<u8>> {
    URL_SAFE
        .decode(encoded)
        .ok()
        .or_else(|| URL_SAFE_NO_PAD.decode(encoded).ok())
}
