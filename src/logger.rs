//! Optional request log.
//!
//! The request logger is enabled with the `--request-log` command-line option. When
//! enabled, this task is launched before setup and every request made by the load
//! test, setup logins included, is sent to it through a channel and written to the log
//! file with Tokio's asynchronous
//! [`BufWriter`](https://docs.rs/tokio/*/tokio/io/struct.BufWriter.html).
//!
//! The format is set with `--request-format`:
//!  - `json` (default): one JSON object per line;
//!  - `csv`: a header line followed by one comma separated line per request;
//!  - `raw`: the Debug output of each request.
//!
//! A `json` line looks like:
//! ```json
//! {"elapsed":1021,"error":"","method":"POST","name":"POST /api/v1/flash-sale/purchase","response_time":12,"status_code":200,"success":true,"url":"http://localhost:8080/api/v1/flash-sale/purchase","user":7}
//! ```

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::metrics::RequestMetric;
use crate::LoadTestError;

/// Supported formats of the request log.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum LogFormat {
    Csv,
    Json,
    Raw,
}
/// Allow `--request-format` from the command line using text variations on supported
/// `LogFormat`s by implementing [`FromStr`].
impl FromStr for LogFormat {
    type Err = LoadTestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let log_format = RegexSet::new([r"(?i)^csv$", r"(?i)^(json|jsn)$", r"(?i)^raw$"])
            .expect("failed to compile log_format RegexSet");
        let matches = log_format.matches(s);
        if matches.matched(0) {
            Ok(LogFormat::Csv)
        } else if matches.matched(1) {
            Ok(LogFormat::Json)
        } else if matches.matched(2) {
            Ok(LogFormat::Raw)
        } else {
            Err(LoadTestError::InvalidOption {
                option: format!("LogFormat::{:?}", s),
                value: s.to_string(),
                detail: "Invalid log_format, expected: csv, json, or raw".to_string(),
            })
        }
    }
}

/// The csv header written before the first request.
fn csv_header() -> String {
    "elapsed,method,name,url,status_code,response_time,success,user,error".to_string()
}

/// Quote a csv field if it contains a separator, a quote or a line break.
fn csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Format one request for the configured log format.
pub(crate) fn format_request(format: &LogFormat, request: &RequestMetric) -> String {
    match format {
        // Use serde_json to create JSON.
        LogFormat::Json => json!(request).to_string(),
        // Manually create CSV, library doesn't support single-row string conversion.
        LogFormat::Csv => format!(
            "{},{},{},{},{},{},{},{},{}",
            request.elapsed,
            request.method,
            csv_field(&request.name),
            csv_field(&request.url),
            request.status_code,
            request.response_time,
            request.success,
            request.user,
            csv_field(&request.error),
        ),
        // Raw format is Debug output of the RequestMetric structure.
        LogFormat::Raw => format!("{:?}", request),
    }
}

/// Logger task, opens the request log and waits for requests from the client.
///
/// A `None` message tells the logger to flush the log and exit.
pub(crate) async fn logger_main(
    path: String,
    format: LogFormat,
    receiver: flume::Receiver<Option<RequestMetric>>,
) -> Result<(), LoadTestError> {
    let mut file = match File::create(&path).await {
        Ok(f) => {
            info!("writing requests to request_log: {}", &path);
            BufWriter::with_capacity(64 * 1024, f)
        }
        Err(e) => {
            error!("failed to create request_log ({}): {}", path, e);
            return Err(LoadTestError::Io(e));
        }
    };

    if format == LogFormat::Csv {
        file.write_all(format!("{}\n", csv_header()).as_ref())
            .await?;
    }

    // Loop waiting for and writing requests.
    while let Ok(message) = receiver.recv_async().await {
        if let Some(request) = message {
            let formatted_log = format_request(&format, &request);
            if let Err(e) = file.write_all(format!("{}\n", formatted_log).as_ref()).await {
                warn!("failed to write to {}: {}", &path, e);
            }
        } else {
            // Empty message means it's time to exit.
            break;
        }
    }

    info!("flushing request_log: {}", &path);
    file.flush().await?;

    Ok(())
}
