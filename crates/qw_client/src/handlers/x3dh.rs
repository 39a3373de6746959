//! Client side of the X3DH handshake.

use std::collections::BTreeMap;

use qw_crypto::keyring::generate_one_time_prekeys;
use qw_crypto::x3dh::{self, FetchedBundle};
use qw_proto::{check_username, Kind, Record, Value, SERVER_NAME, STATUS_ERROR, STATUS_SUCCESS};

use crate::error::ClientError;
use crate::session::{ClientEvent, ClientSession, Flow};

/// The relay answered our bundle request: verify the prekey signature,
/// derive the shared secret, remember the peer SPK and send the reaction.
pub fn handle_bundle_answer(
    session: &mut ClientSession,
    record: &Record,
    events: &mut Vec<ClientEvent>,
) -> Result<Flow, ClientError> {
    if record.status() == Some(STATUS_ERROR) {
        events.push(ClientEvent::Info(format!(
            "failed to request key bundle: {}",
            record.error_text()
        )));
        return Ok(Flow::Continue);
    }

    let owner = record
        .get("owner")
        .and_then(Value::as_str)
        .filter(|o| check_username(o))
        .map(str::to_string);
    let bundle = record.get("key_bundle").and_then(Value::as_dict);
    let (Some(owner), Some(bundle)) = (owner, bundle) else {
        events.push(ClientEvent::Info("relay sent an invalid key bundle".to_string()));
        return Ok(Flow::Continue);
    };

    let ipk = bundle.get("IPK").and_then(Value::as_verifying).cloned();
    let spk = bundle.get("SPK").and_then(Value::as_verifying).cloned();
    let opk = bundle.get("OPK").and_then(Value::as_verifying).cloned();
    let sigma = bundle.get("sigma").and_then(Value::as_bytes).map(<[u8]>::to_vec);
    let (Some(ipk), Some(spk), Some(opk), Some(sigma)) = (ipk, spk, opk, sigma) else {
        events.push(ClientEvent::Info(format!(
            "received an incomplete key bundle for {owner}"
        )));
        return Ok(Flow::Continue);
    };

    session.ensure_keys()?;
    let fetched = FetchedBundle { owner: owner.clone(), ipk, spk: spk.clone(), sigma, opk };

    let username = session.username().to_string();
    let initiation = match x3dh::initiate(&username, &session.own_ik()?, &session.own_ipk()?, &fetched)
    {
        Ok(initiation) => initiation,
        Err(qw_crypto::CryptoError::SignatureVerification) => {
            // Treat as relay-issued; abort without touching any state.
            tracing::warn!(peer = %owner, "invalid SPK signature, aborting handshake");
            events.push(ClientEvent::Info(format!(
                "invalid prekey signature for {owner}, aborting"
            )));
            return Ok(Flow::Continue);
        }
        Err(e) => return Err(e.into()),
    };

    session.map_entry_mut("key_bundles")?.insert(
        owner.clone(),
        Value::Dict(BTreeMap::from([("SPK".to_string(), Value::Verifying(spk))])),
    );
    session.map_entry_mut("shared_secrets")?.insert(
        owner.clone(),
        Value::Bytes(initiation.shared_secret.to_vec()),
    );
    session.db_mut().save()?;

    let own_ipk = session.own_ipk()?;
    let own_spk = session.own_spk()?;
    session.send(
        SERVER_NAME,
        Kind::X3dhReaction,
        BTreeMap::from([
            ("target".to_string(), Value::Str(owner.clone())),
            ("IPK".to_string(), Value::Verifying(own_ipk)),
            ("EPK".to_string(), Value::Verifying(initiation.epk)),
            ("SPK".to_string(), Value::Verifying(own_spk)),
            ("iv".to_string(), Value::Bytes(initiation.challenge_iv.to_vec())),
            ("cipher".to_string(), Value::Bytes(initiation.challenge_cipher.clone())),
            ("tag".to_string(), Value::Bytes(initiation.challenge_tag.to_vec())),
        ]),
    )?;

    events.push(ClientEvent::Info(format!(
        "shared secret computed and saved for {owner}"
    )));
    Ok(Flow::Continue)
}

/// A forwarded reaction: consume our one-time prekey, derive the secret
/// from our own private halves and verify the initiator's challenge.
pub fn handle_reaction(
    session: &mut ClientSession,
    record: &Record,
    events: &mut Vec<ClientEvent>,
) -> Result<Flow, ClientError> {
    let sender = record
        .get("sender")
        .and_then(Value::as_str)
        .filter(|s| check_username(s))
        .map(str::to_string);
    let ipk_a = record.get("IPK").and_then(Value::as_verifying).cloned();
    let spk_a = record.get("SPK").and_then(Value::as_verifying).cloned();
    let epk_a = record.get("EPK").and_then(Value::as_verifying).cloned();
    let iv = record.get("iv").and_then(Value::as_bytes).map(<[u8]>::to_vec);
    let cipher = record.get("cipher").and_then(Value::as_bytes).map(<[u8]>::to_vec);
    let tag = record.get("tag").and_then(Value::as_bytes).map(<[u8]>::to_vec);

    let (Some(sender), Some(ipk_a), Some(spk_a), Some(epk_a), Some(iv), Some(cipher), Some(tag)) =
        (sender, ipk_a, spk_a, epk_a, iv, cipher, tag)
    else {
        events.push(ClientEvent::Info(
            "received a handshake with missing or invalid content".to_string(),
        ));
        return Ok(Flow::Continue);
    };

    session.ensure_keys()?;

    // Consume the oldest one-time prekey pair, replenishing the pool when
    // it runs dry.
    let ok = {
        let keys = session.keys_mut()?;
        let ok = match keys.get_mut("oks").and_then(Value::as_list_mut) {
            Some(oks) if !oks.is_empty() => Some(oks.remove(0)),
            _ => None,
        };
        if ok.is_some() {
            if let Some(opks) = keys.get_mut("OPKs").and_then(Value::as_list_mut) {
                if !opks.is_empty() {
                    opks.remove(0);
                }
            }
        }
        ok
    };
    let Some(Value::Signing(ok)) = ok else {
        tracing::warn!(from = %sender, "handshake but no one-time prekey left");
        events.push(ClientEvent::Info(format!(
            "no one-time prekey available for the handshake from {sender}"
        )));
        return Ok(Flow::Continue);
    };
    session.db_mut().save()?;

    let pool_empty = session
        .keys()?
        .get("oks")
        .and_then(Value::as_list)
        .map(Vec::is_empty)
        .unwrap_or(true);
    if pool_empty {
        let published = replenish_prekeys(session)?;
        session.send(
            SERVER_NAME,
            Kind::X3dhKeys,
            BTreeMap::from([("OPKs".to_string(), Value::List(published))]),
        )?;
        events.push(ClientEvent::Info(
            "one-time prekeys exhausted, uploading a fresh batch".to_string(),
        ));
    }

    let shared = x3dh::react(&session.own_ik()?, &session.own_sk()?, &ok, &ipk_a, &epk_a)?;
    let own_ipk = session.own_ipk()?;
    match x3dh::open_challenge(&shared, &iv, &cipher, &tag, &ipk_a, &own_ipk, &sender) {
        Ok(()) => {
            session
                .map_entry_mut("shared_secrets")?
                .insert(sender.clone(), Value::Bytes(shared.to_vec()));
            session.map_entry_mut("key_bundles")?.insert(
                sender.clone(),
                Value::Dict(BTreeMap::from([("SPK".to_string(), Value::Verifying(spk_a))])),
            );
            session.db_mut().save()?;
            events.push(ClientEvent::Info(format!(
                "successfully computed shared secret with {sender}"
            )));
        }
        Err(e) => {
            tracing::warn!(from = %sender, error = %e, "handshake challenge failed");
            events.push(ClientEvent::Info(format!(
                "handshake from {sender} failed verification"
            )));
        }
    }
    Ok(Flow::Continue)
}

/// The relay asks for fresh one-time prekeys (or acknowledges an upload).
pub fn handle_key_request(
    session: &mut ClientSession,
    record: &Record,
    events: &mut Vec<ClientEvent>,
) -> Result<Flow, ClientError> {
    match record.status() {
        Some(STATUS_ERROR) => {
            events.push(ClientEvent::Info(format!(
                "prekey upload failed: {}",
                record.error_text()
            )));
            return Ok(Flow::Continue);
        }
        Some(STATUS_SUCCESS) => {
            events.push(ClientEvent::Info(
                "relay accepted the fresh one-time prekeys".to_string(),
            ));
            return Ok(Flow::Continue);
        }
        _ => {}
    }

    session.ensure_keys()?;
    let published = replenish_prekeys(session)?;
    session.send(
        SERVER_NAME,
        Kind::X3dhKeys,
        BTreeMap::from([("OPKs".to_string(), Value::List(published))]),
    )?;
    events.push(ClientEvent::Info(
        "relay ran out of our one-time prekeys, uploading more".to_string(),
    ));
    Ok(Flow::Continue)
}

/// Mint a fresh batch, append it to the stored pool and return the public
/// halves as tagged values for upload.
fn replenish_prekeys(session: &mut ClientSession) -> Result<Vec<Value>, ClientError> {
    let batch = generate_one_time_prekeys(qw_crypto::keyring::ONE_TIME_PREKEY_BATCH);
    let mut published = Vec::with_capacity(batch.len());
    {
        let keys = session.keys_mut()?;
        for map in ["oks", "OPKs"] {
            keys.entry(map.to_string())
                .or_insert_with(|| Value::List(Vec::new()));
        }
        for (ok, opk) in batch {
            published.push(Value::Verifying(opk));
            if let Some(oks) = keys.get_mut("oks").and_then(Value::as_list_mut) {
                oks.push(Value::Signing(ok));
            }
            if let Some(opks) = keys.get_mut("OPKs").and_then(Value::as_list_mut) {
                opks.push(Value::Verifying(opk));
            }
        }
    }
    session.db_mut().save()?;
    Ok(published)
}
