use bytes::Bytes;
use futures::StreamExt;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{Method, Request};
use http_body_util::Full;
use micro_bodyparser::multipart::{Multipart, Part, PartMeta, PartOptions, consumer_fn};
use micro_bodyparser::{BodyParserConfig, BodyParserError, ByteSize};
use serde_json::json;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

const BOUNDARY: &str = "demo-boundary";

fn upload_request() -> Request<Full<Bytes>> {
    let body = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"title\"\r\n\r\n\
         holiday\r\n\
         --{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"photos[]\"; filename=\"beach.txt\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         sand and sea\r\n\
         --{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"photos[]\"; filename=\"sunset.exe\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n\
         MZ not really an executable\r\n\
         --{BOUNDARY}--\r\n"
    );

    Request::builder()
        .method(Method::POST)
        .uri("/photos")
        .header(CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .header(CONTENT_LENGTH, body.len())
        .body(Full::new(Bytes::from(body)))
        .expect("demo request should be valid")
}

async fn count_lines(mut part: Part) -> Result<PartMeta, BodyParserError> {
    let mut lines = 1;
    while let Some(chunk) = part.next().await {
        lines += chunk?.iter().filter(|byte| **byte == b'\n').count();
    }
    Ok(PartMeta::default().with_meta(json!({ "lines": lines })))
}

#[tokio::main]
async fn main() -> Result<(), BodyParserError> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut multipart = Multipart::from_request(upload_request(), BodyParserConfig::default().multipart)?;
    let options = PartOptions::default().size(ByteSize::kb(1)).extnames(["txt", "png"]);
    multipart.on_file("photos", options, consumer_fn(count_lines));
    multipart.process().await?;

    info!(fields = %multipart.fields().to_json(), "processed upload");
    for photo in multipart.files().values() {
        if photo.is_valid() {
            info!(file = %photo.to_json(), "accepted");
        } else {
            warn!(client_name = %photo.client_name(), errors = ?photo.errors(), "rejected");
        }
    }
    Ok(())
}
