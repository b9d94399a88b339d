//! mcp-bundle-gateway-bridge — stdio-to-HTTP bridge for stdio-only MCP
//! clients (e.g. Claude Desktop) that want to talk to a bundle hosted by
//! this gateway.
//!
//! Reads JSON-RPC messages from stdin, forwards them to the gateway's
//! bearer-token-authenticated `/mcp` endpoint, and writes responses to
//! stdout.
//!
//! Usage:
//!   mcp-bundle-gateway-bridge --url <GATEWAY_URL> --token <BUNDLE_TOKEN>

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

struct Args {
    url: String,
    token: String,
}

fn parse_args() -> Result<Args, String> {
    let mut args = std::env::args().skip(1);
    let mut url = "http://127.0.0.1:8787/mcp".to_string();
    let mut token: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--url" => {
                url = args.next().ok_or("--url requires a value")?;
            }
            "--token" => {
                token = Some(args.next().ok_or("--token requires a value")?);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    let token = token
        .or_else(|| std::env::var("MCP_BUNDLE_TOKEN").ok())
        .ok_or("--token is required (or set MCP_BUNDLE_TOKEN)")?;

    Ok(Args { url, token })
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("mcp-bundle-gateway-bridge: {e}");
            eprintln!("Usage: mcp-bundle-gateway-bridge --url <URL> --token <TOKEN>");
            return std::process::ExitCode::from(1);
        }
    };

    let client = reqwest::Client::new();
    let mut session_id: Option<String> = None;

    eprintln!("mcp-bundle-gateway-bridge: proxying stdio <-> {}", args.url);

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if let Err(e) = handle_line(&client, &args, &mut session_id, &line, &mut stdout).await {
                            eprintln!("mcp-bundle-gateway-bridge: error: {e}");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        eprintln!("mcp-bundle-gateway-bridge: stdin error: {e}");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("mcp-bundle-gateway-bridge: interrupted");
                break;
            }
        }
    }

    if let Some(id) = &session_id {
        eprintln!("mcp-bundle-gateway-bridge: shutting down, sending DELETE for session cleanup");
        let _ = client
            .delete(&args.url)
            .bearer_auth(&args.token)
            .header("Mcp-Session-Id", id)
            .send()
            .await;
    }

    std::process::ExitCode::SUCCESS
}

async fn handle_line(
    client: &reqwest::Client,
    args: &Args,
    session_id: &mut Option<String>,
    line: &str,
    stdout: &mut tokio::io::Stdout,
) -> Result<(), Box<dyn std::error::Error>> {
    let value: serde_json::Value = serde_json::from_str(line)?;

    let mut request = client.post(&args.url).bearer_auth(&args.token).json(&value);
    if let Some(id) = session_id.as_ref() {
        request = request.header("Mcp-Session-Id", id);
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            if let Some(id) = value.get("id") {
                write_error(stdout, id, format!("gateway unreachable: {e}")).await?;
            }
            return Ok(());
        }
    };

    let status = response.status();
    if let Some(id) = response
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
    {
        *session_id = Some(id.to_string());
    }

    // 202 = notification acknowledged, no response expected
    if status.as_u16() == 202 {
        return Ok(());
    }

    if !status.is_success() {
        if let Some(id) = value.get("id") {
            let body = response.text().await.unwrap_or_default();
            write_error(stdout, id, format!("HTTP {}: {body}", status.as_u16())).await?;
        }
        return Ok(());
    }

    let body = response.bytes().await?;
    stdout.write_all(&body).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;

    Ok(())
}

async fn write_error(
    stdout: &mut tokio::io::Stdout,
    id: &serde_json::Value,
    message: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let err = serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": -32000, "message": message }
    });
    let mut out = serde_json::to_vec(&err)?;
    out.push(b'\n');
    stdout.write_all(&out).await?;
    stdout.flush().await?;
    Ok(())
}
