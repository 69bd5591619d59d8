use std::fmt;
use std::io;

use log::{debug, error, info};
use serde_derive::{Deserialize, Serialize};

use crate::config::RemoteConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    Timeout,
    Status(u16),
    Transport(String),
    Malformed(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Timeout => f.write_str("request timed out"),
            GatewayError::Status(code) => write!(f, "HTTP {code}"),
            GatewayError::Transport(msg) => write!(f, "transport error: {msg}"),
            GatewayError::Malformed(msg) => write!(f, "unexpected response: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<ureq::Error> for GatewayError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, _) => GatewayError::Status(code),
            ureq::Error::Transport(transport) => {
                let timed_out = std::error::Error::source(&transport)
                    .and_then(|source| source.downcast_ref::<io::Error>())
                    .is_some_and(|e| {
                        matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
                    });
                if timed_out {
                    GatewayError::Timeout
                } else {
                    GatewayError::Transport(transport.to_string())
                }
            }
        }
    }
}

/// The remote authority for the cover's on/off state. Holds no local state.
pub trait RemoteState {
    async fn get_state(&self, entity_id: &str) -> Result<bool, GatewayError>;
    async fn set_state(&self, entity_id: &str, on: bool) -> Result<(), GatewayError>;
}

#[derive(Debug, Deserialize)]
struct EntityState {
    state: String,
    #[serde(default)]
    attributes: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ServiceCall<'a> {
    entity_id: &'a str,
}

/// Home Assistant REST API client. Requests are blocking, so each one runs on
/// tokio's blocking pool.
#[derive(Clone)]
pub struct HomeAssistant {
    agent: ureq::Agent,
    base_url: String,
    authorization: String,
    service_domain: String,
    on_state: String,
}

impl HomeAssistant {
    pub fn new(config: &RemoteConfig) -> Self {
        HomeAssistant {
            agent: ureq::AgentBuilder::new().timeout(config.timeout()).build(),
            base_url: config.url.trim_end_matches('/').to_string(),
            authorization: format!("Bearer {}", config.token),
            service_domain: config.service_domain().to_string(),
            on_state: config.on_state().to_string(),
        }
    }

    fn state_url(&self, entity_id: &str) -> String {
        format!("{}/api/states/{}", self.base_url, entity_id)
    }

    fn service_url(&self, on: bool) -> String {
        let service = if on { "turn_on" } else { "turn_off" };
        format!(
            "{}/api/services/{}/{}",
            self.base_url, self.service_domain, service
        )
    }

    fn fetch_state(&self, entity_id: &str) -> Result<bool, GatewayError> {
        info!(target: "gateway", "Getting state of: {}", entity_id);
        let body = self
            .agent
            .get(&self.state_url(entity_id))
            .set("Authorization", &self.authorization)
            .set("Content-Type", "application/json")
            .call()?
            .into_string()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        debug!(target: "gateway", "Raw response body: {}", body);
        parse_state(&body, &self.on_state)
    }

    fn call_service(&self, entity_id: &str, on: bool) -> Result<(), GatewayError> {
        let body = serde_json::to_string(&ServiceCall { entity_id })
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        self.agent
            .post(&self.service_url(on))
            .set("Authorization", &self.authorization)
            .set("Content-Type", "application/json")
            .send_string(&body)?;
        Ok(())
    }
}

fn parse_state(body: &str, on_state: &str) -> Result<bool, GatewayError> {
    let entity: EntityState =
        serde_json::from_str(body).map_err(|e| GatewayError::Malformed(e.to_string()))?;
    info!(target: "gateway", "State: {}", entity.state);
    debug!(target: "gateway", "Attributes: {}", entity.attributes);
    Ok(entity.state == on_state)
}

async fn blocking<T, F>(request: F) -> Result<T, GatewayError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, GatewayError> + Send + 'static,
{
    tokio::task::spawn_blocking(request)
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))?
}

impl RemoteState for HomeAssistant {
    async fn get_state(&self, entity_id: &str) -> Result<bool, GatewayError> {
        let client = self.clone();
        let entity_id = entity_id.to_string();
        let result = blocking(move || client.fetch_state(&entity_id)).await;
        if let Err(err) = &result {
            error!(target: "gateway", "Getting state failed: {}", err);
        }
        result
    }

    async fn set_state(&self, entity_id: &str, on: bool) -> Result<(), GatewayError> {
        info!(
            target: "gateway",
            "Sending {} for {}",
            if on { "turn_on" } else { "turn_off" },
            entity_id
        );
        let client = self.clone();
        let entity = entity_id.to_string();
        let result = blocking(move || client.call_service(&entity, on)).await;
        match &result {
            Ok(()) => info!(target: "gateway", "Service call for {} succeeded", entity_id),
            Err(err) => error!(target: "gateway", "Service call for {} failed: {}", entity_id, err),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead as _, BufReader, Read as _, Write as _};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    use super::*;

    fn config(url: String) -> RemoteConfig {
        RemoteConfig {
            url,
            token: "secret".to_string(),
            entity_id: "input_boolean.gdo_run".to_string(),
            service_domain: None,
            on_state: None,
            timeout_seconds: Some(2),
        }
    }

    /// Serves one canned response and hands back the request head and body.
    fn serve_once(status: &'static str, body: &'static str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request = String::new();
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some(len) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = len.trim().parse().unwrap();
                }
                request.push_str(&line);
                if line == "\r\n" {
                    break;
                }
            }
            let mut payload = vec![0; content_length];
            reader.read_exact(&mut payload).unwrap();
            request.push_str(&String::from_utf8(payload).unwrap());

            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
            tx.send(request).unwrap();
        });
        (url, rx)
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state(r#"{"state":"on","attributes":{}}"#, "on"), Ok(true));
        assert_eq!(parse_state(r#"{"state":"off"}"#, "on"), Ok(false));
        assert_eq!(parse_state(r#"{"state":"open"}"#, "open"), Ok(true));
        assert!(matches!(
            parse_state(r#"{"status":"on"}"#, "on"),
            Err(GatewayError::Malformed(_))
        ));
        assert!(matches!(parse_state("", "on"), Err(GatewayError::Malformed(_))));
    }

    #[test]
    fn test_urls() {
        let client = HomeAssistant::new(&config("http://ha.local:8123/".to_string()));
        assert_eq!(
            client.state_url("input_boolean.gdo_run"),
            "http://ha.local:8123/api/states/input_boolean.gdo_run"
        );
        assert_eq!(
            client.service_url(true),
            "http://ha.local:8123/api/services/input_boolean/turn_on"
        );
        assert_eq!(
            client.service_url(false),
            "http://ha.local:8123/api/services/input_boolean/turn_off"
        );
    }

    #[tokio::test]
    async fn test_get_state_sends_bearer_token() {
        let (url, requests) = serve_once("200 OK", r#"{"state":"on","attributes":{"icon":"mdi:garage"}}"#);
        let client = HomeAssistant::new(&config(url));
        assert_eq!(client.get_state("input_boolean.gdo_run").await, Ok(true));

        let request = requests.recv().unwrap();
        assert!(request.starts_with("GET /api/states/input_boolean.gdo_run "));
        assert!(request.contains("Bearer secret"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let (url, _requests) = serve_once("401 Unauthorized", r#"{"message":"nope"}"#);
        let client = HomeAssistant::new(&config(url));
        assert_eq!(
            client.get_state("input_boolean.gdo_run").await,
            Err(GatewayError::Status(401))
        );
    }

    #[tokio::test]
    async fn test_set_state_posts_entity_id() {
        let (url, requests) = serve_once("200 OK", "[]");
        let client = HomeAssistant::new(&config(url));
        assert_eq!(client.set_state("input_boolean.gdo_run", false).await, Ok(()));

        let request = requests.recv().unwrap();
        assert!(request.starts_with("POST /api/services/input_boolean/turn_off "));
        assert!(request.ends_with(r#"{"entity_id":"input_boolean.gdo_run"}"#));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let client = HomeAssistant::new(&config(url));
        assert!(client.get_state("input_boolean.gdo_run").await.is_err());
    }
}
