use axum::{
    body::Body,
    http::{header, HeaderValue, Response, StatusCode},
    response::{Html, IntoResponse},
};
use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/assets/"]
pub struct Assets;

pub async fn static_handler(path: axum::extract::Path<String>) -> impl IntoResponse {
    let path = path.trim_start_matches('/');

    match serve_asset(path) {
        Ok(response) => response.into_response(),
        Err(status) => (status, "404 Not Found").into_response(),
    }
}

fn serve_asset(path: &str) -> Result<Response<Body>, StatusCode> {
    if let Some(asset) = Assets::get(path) {
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let content_type = HeaderValue::from_str(mime.as_ref())
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        Response::builder()
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(asset.data.into_owned()))
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

/// Render an embedded HTML page, replacing `{{name}}` placeholders with
/// HTML-escaped values.
pub fn render_page(name: &str, vars: &[(&str, String)]) -> Result<Html<String>, StatusCode> {
    let asset = Assets::get(name).ok_or(StatusCode::NOT_FOUND)?;
    let mut page =
        String::from_utf8(asset.data.into_owned()).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    for (key, value) in vars {
        page = page.replace(&format!("{{{{{}}}}}", key), &escape_html(value));
    }

    Ok(Html(page))
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
