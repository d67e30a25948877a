use anyhow::{Context, Result};

/// Generates a self-signed CA plus a server certificate (signed by that CA)
/// and a client certificate (also signed by that CA, for mutual TLS), and
/// writes all five PEM files into `output_dir`. Grounded on
/// `commands/webhook.rs`'s `generate_self_signed_certs`, extended with a
/// client certificate since the scheduler extender requires mTLS rather
/// than server-only TLS.
pub fn generate(service_name: &str, namespace: &str, output_dir: &str, ip_sans: &[String]) -> Result<()> {
    println!("Generating self-signed TLS certificates...\n");

    let bundle = generate_self_signed_bundle(service_name, namespace, ip_sans)?;

    let output_path = std::path::Path::new(output_dir);
    if !output_path.exists() {
        std::fs::create_dir_all(output_path).context("Failed to create output directory")?;
    }

    let ca_path = output_path.join("ca.crt");
    let cert_path = output_path.join("tls.crt");
    let key_path = output_path.join("tls.key");
    let client_cert_path = output_path.join("client.crt");
    let client_key_path = output_path.join("client.key");

    std::fs::write(&ca_path, &bundle.ca_pem).context("Failed to write ca.crt")?;
    std::fs::write(&cert_path, &bundle.server_cert_pem).context("Failed to write tls.crt")?;
    std::fs::write(&key_path, &bundle.server_key_pem).context("Failed to write tls.key")?;
    std::fs::write(&client_cert_path, &bundle.client_cert_pem).context("Failed to write client.crt")?;
    std::fs::write(&client_key_path, &bundle.client_key_pem).context("Failed to write client.key")?;

    println!("  CA certificate .............. {}", ca_path.display());
    println!("  Server certificate .......... {}", cert_path.display());
    println!("  Server key .................. {}", key_path.display());
    println!("  Client certificate .......... {}", client_cert_path.display());
    println!("  Client key .................. {}", client_key_path.display());
    println!();
    println!("  Service name ................ {service_name}");
    println!("  Namespace ................... {namespace}");
    println!("  SANs:");
    println!("    - {service_name}.{namespace}.svc");
    println!("    - {service_name}.{namespace}.svc.cluster.local");
    for ip in ip_sans {
        println!("    - {ip} (IP)");
    }
    println!();
    println!("TLS certificates generated successfully.");

    Ok(())
}

pub struct CertBundle {
    pub ca_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
}

pub fn generate_self_signed_bundle(service_name: &str, namespace: &str, ip_sans: &[String]) -> Result<CertBundle> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
    use std::net::IpAddr;

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, "tas-scheduler-ca");
    ca_dn.push(DnType::OrganizationName, "tas-scheduler");
    ca_params.distinguished_name = ca_dn;

    let ca_key = KeyPair::generate().context("Failed to generate CA key pair")?;
    let ca_cert = ca_params.self_signed(&ca_key).context("Failed to self-sign CA certificate")?;

    let mut server_params = CertificateParams::default();
    let mut server_dn = DistinguishedName::new();
    server_dn.push(DnType::CommonName, format!("{service_name}.{namespace}.svc"));
    server_params.distinguished_name = server_dn;

    let mut sans = vec![
        SanType::DnsName(
            format!("{service_name}.{namespace}.svc")
                .try_into()
                .context("Invalid DNS name for SAN")?,
        ),
        SanType::DnsName(
            format!("{service_name}.{namespace}.svc.cluster.local")
                .try_into()
                .context("Invalid DNS name for SAN")?,
        ),
    ];
    for ip_str in ip_sans {
        let ip: IpAddr = ip_str.parse().context(format!("Invalid IP address for SAN: {ip_str}"))?;
        sans.push(SanType::IpAddress(ip));
    }
    server_params.subject_alt_names = sans;

    let server_key = KeyPair::generate().context("Failed to generate server key pair")?;
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .context("Failed to sign server certificate")?;

    // The client cert authenticates the orchestrator's scheduler process
    // when it calls back into the extender; its CN identifies that caller
    // rather than a DNS-reachable service.
    let mut client_params = CertificateParams::default();
    let mut client_dn = DistinguishedName::new();
    client_dn.push(DnType::CommonName, format!("{service_name}-client"));
    client_params.distinguished_name = client_dn;

    let client_key = KeyPair::generate().context("Failed to generate client key pair")?;
    let client_cert = client_params
        .signed_by(&client_key, &ca_cert, &ca_key)
        .context("Failed to sign client certificate")?;

    Ok(CertBundle {
        ca_pem: ca_cert.pem(),
        server_cert_pem: server_cert.pem(),
        server_key_pem: server_key.serialize_pem(),
        client_cert_pem: client_cert.pem(),
        client_key_pem: client_key.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_self_signed_bundle_produces_five_distinct_pems() {
        let bundle = generate_self_signed_bundle("tas-extender", "default", &[]).unwrap();
        assert!(bundle.ca_pem.contains("BEGIN CERTIFICATE"));
        assert!(bundle.server_cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(bundle.client_cert_pem.contains("BEGIN CERTIFICATE"));
        assert_ne!(bundle.server_cert_pem, bundle.client_cert_pem);
        assert_ne!(bundle.server_key_pem, bundle.client_key_pem);
    }

    #[test]
    fn generate_writes_five_files_to_output_dir() {
        let dir = std::env::temp_dir().join(format!("tas-cert-test-{}", std::process::id()));
        generate("tas-extender", "default", dir.to_str().unwrap(), &[]).unwrap();
        assert!(dir.join("ca.crt").exists());
        assert!(dir.join("tls.crt").exists());
        assert!(dir.join("tls.key").exists());
        assert!(dir.join("client.crt").exists());
        assert!(dir.join("client.key").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_ip_san_is_rejected() {
        let err = generate_self_signed_bundle("tas-extender", "default", &["not-an-ip".to_string()]).unwrap_err();
        assert!(err.to_string().contains("Invalid IP address"));
    }
}
