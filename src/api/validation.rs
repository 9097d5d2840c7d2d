use actix_web::HttpResponse;
use serde::{de::DeserializeOwned, Serialize};
use validator::Validate;

use crate::api::error::ServiceError;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub fields: serde_json::Value,
}

fn bad_request(error: &str, fields: serde_json::Map<String, serde_json::Value>) -> actix_web::Error {
    actix_web::error::InternalError::from_response(
        "",
        HttpResponse::BadRequest().json(ErrorResponse {
            error: error.to_string(),
            fields: serde_json::Value::Object(fields),
        }),
    )
    .into()
}

/// JsonConfig with the project's standard error body for every JSON extractor
pub fn json_config() -> actix_web_validator::JsonConfig {
    actix_web_validator::JsonConfig::default()
        .error_handler(|err, _req| {
            let mut fields = serde_json::Map::new();

            match err {
                actix_web_validator::Error::Validate(validation_errors) => {
                    for (field, errors) in validation_errors.field_errors() {
                        let messages: Vec<String> = errors
                            .iter()
                            .map(|e| {
                                e.message
                                    .as_ref()
                                    .map(|m| m.to_string())
                                    .unwrap_or_else(|| format!("Invalid value for {}", field))
                            })
                            .collect();
                        fields.insert(field.to_string(), serde_json::json!({"errors": messages}));
                    }
                    bad_request("Validation failed", fields)
                }
                actix_web_validator::Error::Deserialize(de_err) => {
                    let err_string = de_err.to_string();
                    let message = if err_string.contains("EOF while parsing") {
                        "Request body is empty. Expected JSON payload".to_string()
                    } else if err_string.contains("unknown variant") {
                        // serde names the accepted values, which is what callers need
                        err_string
                    } else {
                        "Invalid JSON format".to_string()
                    };
                    fields.insert("message".to_string(), serde_json::json!(message));
                    bad_request("Request validation failed", fields)
                }
                _ => {
                    fields.insert("message".to_string(), serde_json::json!("Validation error"));
                    bad_request("Validation failed", fields)
                }
            }
        })
}

/// Parse a JSON body whose fields are all optional; an empty body is `T::default()`.
pub fn optional_json<T>(body: &[u8]) -> Result<T, ServiceError>
where
    T: DeserializeOwned + Validate + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    let value: T = serde_json::from_slice(body)
        .map_err(|e| ServiceError::Validation(format!("Invalid JSON body: {}", e)))?;
    value
        .validate()
        .map_err(|e| ServiceError::Validation(e.to_string()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, Validate)]
    struct Note {
        #[validate(length(max = 3))]
        text: Option<String>,
    }

    #[test]
    fn optional_json_accepts_empty_and_validates_present_bodies() {
        assert!(optional_json::<Note>(b"").unwrap().text.is_none());
        assert!(optional_json::<Note>(b"  \n").unwrap().text.is_none());
        assert_eq!(
            optional_json::<Note>(br#"{"text":"ok"}"#).unwrap().text.as_deref(),
            Some("ok")
        );
        assert!(matches!(
            optional_json::<Note>(br#"{"text":"too long"}"#),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            optional_json::<Note>(b"{not json"),
            Err(ServiceError::Validation(_))
        ));
    }
}
