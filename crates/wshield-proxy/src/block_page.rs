//! The page served for blocked HTTP requests

/// Escape text for inclusion in HTML element content or attributes
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
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

/// HTML body naming the blocked host and the reason
pub fn render(host: &str, reason: &str) -> String {
    let host = escape_html(host);
    let reason = escape_html(reason);
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Access Blocked - WebShield</title>
<style>
body {{ font-family: system-ui, sans-serif; background: #f4f5f7; color: #1f2933; margin: 0; }}
main {{ max-width: 36rem; margin: 12vh auto; padding: 2rem; background: #fff; border-radius: 8px; box-shadow: 0 2px 12px rgba(0,0,0,.08); }}
h1 {{ color: #c53030; font-size: 1.5rem; margin-top: 0; }}
code {{ background: #edf2f7; padding: .1rem .3rem; border-radius: 4px; }}
</style>
</head>
<body>
<main>
<h1>Access Blocked</h1>
<p>The request to <code>{host}</code> was blocked by WebShield.</p>
<p><strong>Reason:</strong> {reason}</p>
<p>If you believe this is a mistake, add the domain to your whitelist.</p>
</main>
</body>
</html>
"#
    )
}

/// Complete `403` response with the rendered page
pub fn response(host: &str, reason: &str) -> Vec<u8> {
    let body = render(host, reason);
    let mut out = format!(
        "HTTP/1.1 403 Forbidden\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Cache-Control: no-store\r\n\
         Connection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}
