//! Proxy error pages, embedded at compile time.
//!
//! Three variants: unknown subdomain (404), tunnel offline (503), and live
//! tunnel whose session vanished (503). Placeholders `{{subdomain}}` and
//! `{{dashboard_url}}` are interpolated at render time.

const TUNNEL_NOT_FOUND: &str = include_str!("templates/tunnel_not_found.html");
const TUNNEL_OFFLINE: &str = include_str!("templates/tunnel_offline.html");
const TUNNEL_CONNECTION_LOST: &str = include_str!("templates/tunnel_connection_lost.html");

fn render(template: &str, subdomain: &str, dashboard_url: &str) -> String {
    template
        .replace("{{subdomain}}", &escape(subdomain))
        .replace("{{dashboard_url}}", dashboard_url)
}

/// Minimal HTML escaping. Validated subdomains can't contain these, but the
/// not-found page echoes arbitrary host labels.
fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn tunnel_not_found(subdomain: &str, dashboard_url: &str) -> String {
    render(TUNNEL_NOT_FOUND, subdomain, dashboard_url)
}

pub fn tunnel_offline(subdomain: &str, dashboard_url: &str) -> String {
    render(TUNNEL_OFFLINE, subdomain, dashboard_url)
}

pub fn tunnel_connection_lost(subdomain: &str, dashboard_url: &str) -> String {
    render(TUNNEL_CONNECTION_LOST, subdomain, dashboard_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_name_the_subdomain() {
        for page in [
            tunnel_not_found("gone", "http://localhost:3000/dashboard"),
            tunnel_offline("demo", "http://localhost:3000/dashboard"),
            tunnel_connection_lost("demo", "http://localhost:3000/dashboard"),
        ] {
            assert!(page.contains("demo") || page.contains("gone"));
            assert!(page.contains("http://localhost:3000/dashboard"));
            assert!(!page.contains("{{"));
        }
    }

    #[test]
    fn hostile_labels_are_escaped() {
        let page = tunnel_not_found("<script>", "http://localhost:3000");
        assert!(!page.contains("<script>"));
        assert!(page.contains("&lt;script&gt;"));
    }
}
