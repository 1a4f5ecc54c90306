//! Mock downstream Kusto MCP server for integration testing.
//!
//! Reads newline-delimited JSON-RPC from stdin and writes responses to
//! stdout, implementing just enough of the MCP protocol to exercise the
//! router: `initialize`, `ping`, `tools/list`, `tools/call`, and the
//! lifecycle notifications.
//!
//! # Special behaviors
//!
//! - `tools/call` echoes the tool name, arguments, and the credential
//!   environment back as a JSON text content item.
//! - Arguments containing `"crash": true` make the server exit with code 3
//!   before responding (for child-exit and reconnect testing).
//! - Arguments containing `"fail": true` produce an `isError` result.
//! - When `AZURE_CLIENT_ID` is `fail-start`, the server exits immediately
//!   with code 7 (for partial-init testing).

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};

fn main() {
    if std::env::var("AZURE_CLIENT_ID").as_deref() == Ok("fail-start") {
        std::process::exit(7);
    }

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let reader = BufReader::new(stdin.lock());
    let mut writer = stdout.lock();

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        handle_message(&msg, &mut writer);
    }
}

fn handle_message(msg: &Value, writer: &mut impl Write) {
    let method = msg.get("method").and_then(|v| v.as_str());
    let id = msg.get("id").cloned();

    match method {
        Some("initialize") => {
            let resp = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2025-03-26",
                    "capabilities": {
                        "tools": {}
                    },
                    "serverInfo": {
                        "name": "mock-kusto-mcp",
                        "version": "0.1.0"
                    }
                }
            });
            write_msg(writer, &resp);
        }

        Some("ping") => {
            let resp = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {}
            });
            write_msg(writer, &resp);
        }

        Some("tools/list") => {
            let resp = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "tools": [
                        {
                            "name": "kusto_query",
                            "description": "Run a KQL query against a cluster database",
                            "inputSchema": {
                                "type": "object",
                                "properties": {
                                    "cluster": {"type": "string"},
                                    "database": {"type": "string"},
                                    "query": {"type": "string"}
                                },
                                "required": ["cluster", "database", "query"]
                            }
                        },
                        {
                            "name": "kusto_cluster_list",
                            "description": "List Kusto clusters in a subscription",
                            "inputSchema": {
                                "type": "object",
                                "properties": {
                                    "subscriptionId": {"type": "string"}
                                }
                            }
                        }
                    ]
                }
            });
            write_msg(writer, &resp);
        }

        Some("tools/call") => {
            let tool_name = msg
                .pointer("/params/name")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let arguments = msg
                .pointer("/params/arguments")
                .cloned()
                .unwrap_or(json!({}));

            // Special: die without answering
            if arguments.get("crash").and_then(|v| v.as_bool()) == Some(true) {
                std::process::exit(3);
            }

            // Special: report a tool-level error
            if arguments.get("fail").and_then(|v| v.as_bool()) == Some(true) {
                let resp = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "content": [{
                            "type": "text",
                            "text": format!("mock failure running {tool_name}")
                        }],
                        "isError": true
                    }
                });
                write_msg(writer, &resp);
                return;
            }

            let echo = json!({
                "tool": tool_name,
                "args": arguments,
                "identity": std::env::var("AZURE_CLIENT_ID").unwrap_or_default(),
                "tokenCredentials": std::env::var("AZURE_TOKEN_CREDENTIALS").unwrap_or_default(),
                "readOnly": std::env::args().any(|a| a == "--read-only"),
            });
            let resp = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "content": [{
                        "type": "text",
                        "text": echo.to_string()
                    }],
                    "isError": false
                }
            });
            write_msg(writer, &resp);
        }

        Some("notifications/initialized") | Some("notifications/cancelled") => {
            // Notifications have no response
        }

        Some(unknown) => {
            if let Some(req_id) = id {
                let resp = json!({
                    "jsonrpc": "2.0",
                    "id": req_id,
                    "error": {
                        "code": -32601,
                        "message": format!("Method not found: {unknown}")
                    }
                });
                write_msg(writer, &resp);
            }
        }

        None => {
            // Response from the client side — nothing to do
        }
    }
}

fn write_msg(writer: &mut impl Write, msg: &Value) {
    let s = serde_json::to_string(msg).expect("serialize JSON");
    writeln!(writer, "{s}").expect("write to stdout");
    writer.flush().expect("flush stdout");
}
