//! Node attestation handshakes driven end to end.
//!
//! A configured server-side attestor and a client binding exchange only the
//! serialized messages an orchestrator would relay between them.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use trustbind_crypto::{sshpop, x509pop, PopError, PopHandshake, SshPopAttestor, X509PopAttestor};

use crate::test_utils::*;

fn ssh_attestor(authorities: &[&str]) -> SshPopAttestor {
    let authorities: Vec<String> = authorities.iter().map(|ca| format!("{:?}", ca.trim())).collect();
    let attestor = SshPopAttestor::new();
    attestor
        .configure(
            "example.org",
            &format!("cert_authorities = [{}]\n", authorities.join(", ")),
        )
        .unwrap();
    attestor
}

#[test]
fn test_x509_rsa_node_attestation() {
    init_tracing();
    let attestor = X509PopAttestor::new();
    attestor.configure("example.org", "").unwrap();
    let client = x509pop::Client::from_pem(X509_RSA_CERT, X509_RSA_KEY).unwrap();

    let mut handshake = attestor.new_handshake().unwrap();
    let id = drive_handshake(&mut handshake, &client.attestation_data().unwrap(), |challenge| {
        client.respond_to_challenge(challenge)
    })
    .unwrap();

    assert_eq!(
        id.to_string(),
        "spiffe://example.org/spire/agent/x509pop/9f60bb2cb1b2833a007283b3d0fad886918aeb0e"
    );
}

#[test]
fn test_x509_ec_node_attestation_with_template() {
    let attestor = X509PopAttestor::new();
    attestor
        .configure(
            "example.org",
            r#"agent_path_template = "/{{ PluginName }}/{{ SerialNumber }}/{{ Fingerprint }}""#,
        )
        .unwrap();
    let client = x509pop::Client::from_pem(X509_EC_CERT, X509_EC_KEY).unwrap();

    let mut handshake = attestor.new_handshake().unwrap();
    let id = drive_handshake(&mut handshake, &client.attestation_data().unwrap(), |challenge| {
        client.respond_to_challenge(challenge)
    })
    .unwrap();

    assert_eq!(
        id.path(),
        "/spire/agent/x509pop/4343/ecdd7b582a9aed4d929a75482c04713409b00069"
    );
}

#[test]
fn test_x509_response_replayed_into_other_handshake_rejected() {
    let attestor = X509PopAttestor::new();
    attestor.configure("example.org", "").unwrap();
    let client = x509pop::Client::from_pem(X509_EC_CERT, X509_EC_KEY).unwrap();
    let data = client.attestation_data().unwrap();

    let mut first = attestor.new_handshake().unwrap();
    first.verify_attestation_data(&data).unwrap();
    let response = client
        .respond_to_challenge(&first.issue_challenge().unwrap())
        .unwrap();

    let mut second = attestor.new_handshake().unwrap();
    second.verify_attestation_data(&data).unwrap();
    let _ = second.issue_challenge().unwrap();
    let err = second.verify_challenge_response(&response).unwrap_err();
    assert!(matches!(err, PopError::SignatureInvalid(_)));
    assert!(err.is_security_failure());

    // The original handshake still accepts the response it asked for
    first.verify_challenge_response(&response).unwrap();
    assert!(first.agent_id().is_ok());
}

#[test]
fn test_concurrent_x509_handshakes_are_independent() {
    let attestor = Arc::new(X509PopAttestor::new());
    attestor.configure("example.org", "").unwrap();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let attestor = Arc::clone(&attestor);
            thread::spawn(move || {
                let client = x509pop::Client::from_pem(X509_EC_CERT, X509_EC_KEY).unwrap();
                let mut handshake = attestor.new_handshake().unwrap();
                handshake
                    .verify_attestation_data(&client.attestation_data().unwrap())
                    .unwrap();
                let challenge = handshake.issue_challenge().unwrap();
                handshake
                    .verify_challenge_response(&client.respond_to_challenge(&challenge).unwrap())
                    .unwrap();
                challenge
            })
        })
        .collect();

    let challenges: HashSet<Vec<u8>> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(challenges.len(), 8);
}

#[test]
fn test_ssh_node_attestation() {
    init_tracing();
    let attestor = ssh_attestor(&[SSH_CA]);
    let client = sshpop::Client::from_openssh(SSH_HOST_CERT, SSH_HOST_KEY).unwrap();
    let mut client_handshake = client.new_handshake();

    let mut handshake = attestor.new_handshake().unwrap();
    let data = client_handshake.attestation_data().unwrap();
    let id = drive_handshake(&mut handshake, &data, |challenge| {
        client_handshake.respond_to_challenge(challenge)
    })
    .unwrap();

    assert_eq!(
        id.to_string(),
        "spiffe://example.org/spire/agent/sshpop/4f-aG47YxroZFqmLFM9WFyqq228K8qwj_j-xJd434Oc"
    );
}

#[test]
fn test_ssh_certificate_from_untrusted_authority_rejected() {
    // The rogue certificate is well formed and validly signed, just not by
    // an authority this server trusts
    let attestor = ssh_attestor(&[SSH_CA]);
    let client = sshpop::Client::from_openssh(SSH_ROGUE_HOST_CERT, SSH_HOST_KEY).unwrap();
    let mut client_handshake = client.new_handshake();

    let mut handshake = attestor.new_handshake().unwrap();
    let err = handshake
        .verify_attestation_data(&client_handshake.attestation_data().unwrap())
        .unwrap_err();
    assert!(matches!(err, PopError::UntrustedAuthority(_)));

    // A failed handshake cannot be resumed
    assert!(matches!(
        handshake.issue_challenge(),
        Err(PopError::HandshakeState { .. })
    ));

    // Trusting the rogue authority as well admits the same certificate
    let attestor = ssh_attestor(&[SSH_CA, SSH_ROGUE_CA]);
    let mut client_handshake = client.new_handshake();
    let mut handshake = attestor.new_handshake().unwrap();
    let data = client_handshake.attestation_data().unwrap();
    drive_handshake(&mut handshake, &data, |challenge| {
        client_handshake.respond_to_challenge(challenge)
    })
    .unwrap();
}

#[test]
fn test_handshakes_refused_until_configured() {
    let attestor = SshPopAttestor::new();
    let err = attestor.new_handshake().err().unwrap();
    assert!(err.is_configuration());

    let attestor = X509PopAttestor::new();
    assert!(attestor.new_handshake().err().unwrap().is_configuration());
}
