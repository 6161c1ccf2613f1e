//! Proxy auto-config generation
//!
//! Renders PAC text from the ledger's manual-direct snapshot: plain
//! hostnames, IP literals and known-direct domains go DIRECT, everything
//! else through the proxy. The embedded domain extraction mirrors
//! [`crate::classify::effective_domain`].

/// Generate PAC text advertising `proxy_addr` as the proxy.
pub fn generate(proxy_addr: &str, direct_domains: &[String]) -> String {
    let mut entries = String::new();
    for d in direct_domains {
        entries.push_str(&format!("        \"{}\": true,\n", d));
    }
    format!(
        r#"var directList = {{
{entries}}};

var proxy = "PROXY {proxy_addr}; DIRECT";

var sharedSuffix = {{ "ac": true, "co": true, "org": true, "com": true, "net": true, "edu": true }};

function effectiveDomain(host) {{
    var parts = host.split(".");
    if (parts.length <= 2) return host;
    var keep = sharedSuffix[parts[parts.length - 2]] ? 3 : 2;
    return parts.slice(parts.length - keep).join(".");
}}

function FindProxyForURL(url, host) {{
    if (isPlainHostName(host) || /^\d+\.\d+\.\d+\.\d+$/.test(host)) {{
        return "DIRECT";
    }}
    if (directList[effectiveDomain(host)]) {{
        return "DIRECT";
    }}
    return proxy;
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pac_contains_proxy_and_domains() {
        let pac = generate(
            "127.0.0.1:7777",
            &["example.com".to_string(), "openbsd.org".to_string()],
        );
        assert!(pac.contains("PROXY 127.0.0.1:7777; DIRECT"));
        assert!(pac.contains("\"example.com\": true"));
        assert!(pac.contains("\"openbsd.org\": true"));
        assert!(pac.contains("function FindProxyForURL"));
    }

    #[test]
    fn test_pac_with_empty_direct_list() {
        let pac = generate("127.0.0.1:7777", &[]);
        assert!(pac.contains("var directList = {\n};"));
    }
}
