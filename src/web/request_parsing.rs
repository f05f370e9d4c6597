// Request parsing for the caption upload endpoint

use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Request};
use log::debug;

use caption_types::GenerationParams;

use super::error::CaptionError;

/// Raw fields of a `multipart/form-data` caption request.
#[derive(Debug, Default)]
pub struct CaptionForm {
    pub file: Option<Bytes>,
    pub prompt: Option<String>,
    pub max_new_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CaptionForm {
    /// Image bytes plus resolved generation params. Fails if `file` was not sent.
    pub fn into_parts(self, default_prompt: &str) -> Result<(Bytes, GenerationParams), CaptionError> {
        let file = self
            .file
            .ok_or_else(|| CaptionError::InvalidInput("missing required field: file".to_string()))?;
        let params =
            GenerationParams::resolve(self.prompt, self.max_new_tokens, self.temperature, default_prompt);
        Ok((file, params))
    }
}

/// Read and validate a multipart caption upload, enforcing `max_bytes` on the whole body.
pub async fn parse_caption_form(req: Request<Body>, max_bytes: u64) -> Result<CaptionForm, CaptionError> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let boundary = multer::parse_boundary(&content_type).map_err(|_| {
        CaptionError::InvalidInput("expected a multipart/form-data body".to_string())
    })?;

    let constraints = multer::Constraints::new()
        .size_limit(multer::SizeLimit::new().whole_stream(max_bytes));
    let mut multipart = multer::Multipart::with_constraints(req.into_body(), boundary, constraints);

    let mut form = CaptionForm::default();
    while let Some(field) = multipart.next_field().await.map_err(invalid_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => form.file = Some(field.bytes().await.map_err(invalid_multipart)?),
            "prompt" => form.prompt = Some(field.text().await.map_err(invalid_multipart)?),
            "max_new_tokens" => {
                let raw = field.text().await.map_err(invalid_multipart)?;
                form.max_new_tokens = Some(parse_max_new_tokens(&raw)?);
            }
            "temperature" => {
                let raw = field.text().await.map_err(invalid_multipart)?;
                form.temperature = Some(parse_temperature(&raw)?);
            }
            other => debug!("[REQUEST] Ignoring unknown form field {other:?}"),
        }
    }

    Ok(form)
}

fn invalid_multipart(e: multer::Error) -> CaptionError {
    CaptionError::InvalidInput(format!("invalid multipart body: {e}"))
}

fn parse_max_new_tokens(raw: &str) -> Result<u32, CaptionError> {
    match raw.trim().parse::<u32>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(CaptionError::InvalidInput(format!(
            "max_new_tokens must be a positive integer, got {raw:?}"
        ))),
    }
}

fn parse_temperature(raw: &str) -> Result<f32, CaptionError> {
    match raw.trim().parse::<f32>() {
        Ok(t) if t.is_finite() => Ok(t),
        _ => Err(CaptionError::InvalidInput(format!(
            "temperature must be a finite number, got {raw:?}"
        ))),
    }
}
