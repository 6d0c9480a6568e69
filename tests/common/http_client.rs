//! HTTP client utilities for testing.
//!
//! Helper functions for making HTTP requests to the atmofed server during tests.

use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error;
use std::net::SocketAddr;
use std::time::Duration;

/// Default timeout for HTTP requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a default test client
pub fn create_test_client() -> Client {
    Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .expect("Failed to build test HTTP client")
}

/// Build a URL for an atmofed server endpoint
pub fn build_url(addr: &SocketAddr, path: &str) -> Url {
    format!("http://{}{}", addr, path)
        .parse()
        .expect("Failed to parse URL")
}

/// Make a GET request to the atmofed server
pub async fn get(addr: &SocketAddr, path: &str) -> Result<Response, Box<dyn Error>> {
    let client = create_test_client();
    let url = build_url(addr, path);
    println!("Making request to: {}", url);
    Ok(client.get(url).send().await?)
}

/// Make a POST request with a JSON body
pub async fn post<B: Serialize>(
    addr: &SocketAddr,
    path: &str,
    body: &B,
) -> Result<Response, Box<dyn Error>> {
    let client = create_test_client();
    let url = build_url(addr, path);
    println!("Posting to: {}", url);
    Ok(client.post(url).json(body).send().await?)
}

/// Make a DELETE request
pub async fn delete(addr: &SocketAddr, path: &str) -> Result<Response, Box<dyn Error>> {
    let client = create_test_client();
    Ok(client.delete(build_url(addr, path)).send().await?)
}

/// Make a GET request and parse the JSON response
pub async fn get_json<T: DeserializeOwned>(
    addr: &SocketAddr,
    path: &str,
) -> Result<T, Box<dyn Error>> {
    expect_json(get(addr, path).await?).await
}

/// Make a POST request and parse the JSON response
pub async fn post_json<B: Serialize, T: DeserializeOwned>(
    addr: &SocketAddr,
    path: &str,
    body: &B,
) -> Result<T, Box<dyn Error>> {
    expect_json(post(addr, path, body).await?).await
}

async fn expect_json<T: DeserializeOwned>(response: Response) -> Result<T, Box<dyn Error>> {
    if response.status() != StatusCode::OK {
        return Err(format!(
            "Unexpected status code: {}, body: {:?}",
            response.status(),
            response.text().await
        )
        .into());
    }

    Ok(response.json::<T>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url() {
        let addr: SocketAddr = ([127, 0, 0, 1], 8000).into();
        let url = build_url(&addr, "/query");
        assert_eq!(url.as_str(), "http://127.0.0.1:8000/query");
    }
}
