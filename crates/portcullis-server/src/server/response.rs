//! Delivery of authorization responses to the client's `redirect_uri`.
//!
//! `query` and `fragment` answer with a 302, `form_post` with an
//! auto-submitting form and `web_message` with a page that posts the
//! response to the opener (the silent-auth iframe contract).

use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use url::form_urlencoded;

use crate::auth::{AuthResponse, ResponseMode};

/// A plain 302.
pub fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn encode_pairs(pairs: &[(String, String)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Appends `pairs` to the query of `redirect_uri`, keeping existing
/// parameters.
pub fn query_location(redirect_uri: &str, pairs: &[(String, String)]) -> String {
    match url::Url::parse(redirect_uri) {
        Ok(mut url) => {
            url.query_pairs_mut().extend_pairs(pairs);
            url.to_string()
        }
        Err(_) => {
            let separator = if redirect_uri.contains('?') { '&' } else { '?' };
            format!("{}{}{}", redirect_uri, separator, encode_pairs(pairs))
        }
    }
}

pub fn fragment_location(redirect_uri: &str, pairs: &[(String, String)]) -> String {
    let base = redirect_uri.split('#').next().unwrap_or(redirect_uri);
    format!("{}#{}", base, encode_pairs(pairs))
}

fn form_post_page(response: &AuthResponse) -> String {
    let inputs: String = response
        .pairs()
        .iter()
        .map(|(name, value)| {
            format!(
                r#"<input type="hidden" name="{}" value="{}" />"#,
                html_escape::encode_double_quoted_attribute(name),
                html_escape::encode_double_quoted_attribute(value)
            )
        })
        .collect::<Vec<_>>()
        .join("\n      ");

    format!(
        r#"<!DOCTYPE html>
<html>
  <head><title>Submit This Form</title></head>
  <body onload="javascript:document.forms[0].submit()">
    <form method="post" action="{}">
      {}
    </form>
  </body>
</html>"#,
        html_escape::encode_double_quoted_attribute(&response.redirect_uri),
        inputs
    )
}

/// JSON that is safe to embed inside a `<script>` element.
fn script_json(value: &serde_json::Value) -> String {
    value
        .to_string()
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
}

fn web_message_page(response: &AuthResponse) -> String {
    let body = serde_json::Value::Object(response.fields.clone());
    let target_origin = url::Url::parse(&response.redirect_uri)
        .map(|u| u.origin().ascii_serialization())
        .unwrap_or_else(|_| "*".to_string());

    format!(
        r#"<!DOCTYPE html>
<html>
  <head><title>Authorization Response</title></head>
  <body>
    <script type="text/javascript">
      (function (window, document) {{
        var targetOrigin = {origin};
        var authorizationResponse = {{type: "authorization_response", response: {body}}};
        var mainWin = window.opener ? window.opener : window.parent;
        mainWin.postMessage(authorizationResponse, targetOrigin);
      }})(this, this.document);
    </script>
  </body>
</html>"#,
        origin = script_json(&serde_json::Value::String(target_origin)),
        body = script_json(&body),
    )
}

/// Renders `response` in its response mode.
pub fn render(response: &AuthResponse) -> Response {
    match response.mode {
        ResponseMode::Query => found(&query_location(&response.redirect_uri, &response.pairs())),
        ResponseMode::Fragment => {
            found(&fragment_location(&response.redirect_uri, &response.pairs()))
        }
        ResponseMode::FormPost => Html(form_post_page(response)).into_response(),
        ResponseMode::WebMessage => Html(web_message_page(response)).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    fn response(mode: ResponseMode) -> AuthResponse {
        let mut fields = Map::new();
        fields.insert("code".into(), Value::String("abc".into()));
        fields.insert("state".into(), Value::String("a b&c".into()));
        AuthResponse {
            redirect_uri: "https://app.example.com/cb?x=1".to_string(),
            mode,
            fields,
        }
    }

    #[test]
    fn query_keeps_existing_parameters() {
        let location = query_location(
            "https://app.example.com/cb?x=1",
            &[("code".to_string(), "abc".to_string())],
        );
        assert_eq!(location, "https://app.example.com/cb?x=1&code=abc");
    }

    #[test]
    fn fragment_replaces_existing_fragment() {
        let location = fragment_location(
            "https://app.example.com/cb#old",
            &[("access_token".to_string(), "t".to_string())],
        );
        assert_eq!(location, "https://app.example.com/cb#access_token=t");
    }

    #[test]
    fn redirect_modes_use_302() {
        let rendered = render(&response(ResponseMode::Query));
        assert_eq!(rendered.status(), StatusCode::FOUND);
        let location = rendered.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.contains("state=a+b%26c"));
    }

    #[test]
    fn form_post_escapes_values() {
        let page = form_post_page(&response(ResponseMode::FormPost));
        assert!(page.contains(r#"value="a b&amp;c""#));
        assert!(page.contains(r#"action="https://app.example.com/cb?x=1""#));
    }

    #[test]
    fn web_message_embeds_response_object() {
        let login_required = AuthResponse::login_required(
            "https://app.example.com/cb",
            ResponseMode::WebMessage,
            Some("</script>"),
        );
        let page = web_message_page(&login_required);
        assert!(page.contains("response: {"));
        assert!(page.contains("Login required"));
        assert!(page.contains(r#"var targetOrigin = "https://app.example.com";"#));
        assert!(!page.contains("</script>\""));
    }
}
