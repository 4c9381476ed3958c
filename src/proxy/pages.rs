//! Styled HTML bodies for boundary errors on the public surface.

const STYLE: &str = "\
body{font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',sans-serif;\
background:#0f1222;color:#e6e8f0;display:flex;align-items:center;\
justify-content:center;min-height:100vh;margin:0}\
.card{background:#1a1e33;border-radius:12px;padding:48px 56px;max-width:520px;\
text-align:center;box-shadow:0 8px 32px rgba(0,0,0,.4)}\
h1{font-size:64px;margin:0 0 8px;color:#7c8cff}\
h2{font-size:20px;margin:0 0 16px;font-weight:600}\
p{color:#9aa0b5;line-height:1.5;margin:0}\
code{background:#252a47;padding:2px 8px;border-radius:4px;color:#c3c9e8}\
input{width:100%;box-sizing:border-box;margin:16px 0 8px;padding:10px 12px;\
border-radius:6px;border:1px solid #3a4066;background:#10132a;color:#e6e8f0}\
button{width:100%;padding:10px;border:0;border-radius:6px;background:#7c8cff;\
color:#0f1222;font-weight:600;cursor:pointer}";

fn render(status: u16, title: &str, message: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
<title>{status} — {title}</title><style>{STYLE}</style></head><body>\
<div class=\"card\"><h1>{status}</h1><h2>{title}</h2><p>{message}</p></div>\
</body></html>"
    )
}

pub fn not_found(host: &str) -> String {
    render(
        404,
        "Tunnel not found",
        &format!("No tunnel is registered for <code>{}</code>.", host),
    )
}

pub fn tunnel_offline(sub_domain: &str) -> String {
    render(
        503,
        "Tunnel not connected",
        &format!(
            "The tunnel <code>{}</code> exists but its client is not currently connected. \
Try again in a moment.",
            sub_domain
        ),
    )
}

pub fn bad_gateway(reason: &str) -> String {
    render(502, "Tunnel error", reason)
}

pub fn gateway_timeout() -> String {
    render(
        504,
        "Tunnel timeout",
        "The tunneled origin did not answer within the response window.",
    )
}

/// Interactive prompt served on 401. Submits the password as the
/// `x-tungo-password` header; on success the ack response sets the auth
/// cookie and the page reloads.
pub fn password_prompt(sub_domain: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
<title>401 — Password required</title><style>{STYLE}</style></head><body>\
<div class=\"card\"><h1>401</h1><h2>Password required</h2>\
<p>The tunnel <code>{sub}</code> is password protected.</p>\
<input id=\"pw\" type=\"password\" placeholder=\"Password\" autofocus>\
<button onclick=\"submitPw()\">Unlock</button>\
<script>async function submitPw(){{\
const r=await fetch(location.pathname,{{headers:{{'x-tungo-password':\
document.getElementById('pw').value}}}});\
if(r.status===200){{location.reload()}}else{{\
document.getElementById('pw').value='';\
document.getElementById('pw').placeholder='Wrong password, try again'}}}}\
document.getElementById('pw').addEventListener('keydown',\
e=>{{if(e.key==='Enter')submitPw()}});</script>\
</div></body></html>",
        sub = sub_domain,
        STYLE = STYLE,
    )
}
