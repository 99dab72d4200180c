//! Shared test fixtures: deterministic keypairs, signed wire links, and
//! fake collaborators.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::DateTime;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::api::{ApiArg, ApiClient, ApiError, ApiRes};
use crate::config::ChainConfig;
use crate::context::{Context, ManualClock};
use crate::keys::{KeyFamily, ServerKey};
use crate::link::{ChainLink, WireLink};
use crate::store::SqliteStore;
use crate::types::{Fingerprint, Kid, LinkId, Seqno, SigId, Uid};

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// A deterministic test keypair.
pub struct TestKey {
    pub signing: SigningKey,
    pub kid: Kid,
    pub fingerprint: Option<Fingerprint>,
}

impl TestKey {
    /// Derives a keypair from a seed byte. Equal seeds give equal keys.
    pub fn generate(seed: u8) -> Self {
        let signing = SigningKey::from_bytes(&[seed; 32]);
        let verifying = signing.verifying_key();
        let mut kid_bytes = vec![0x01, 0x20];
        kid_bytes.extend_from_slice(verifying.as_bytes());
        kid_bytes.push(0x0a);
        Self {
            signing,
            kid: Kid::from_bytes(kid_bytes).expect("kid"),
            fingerprint: None,
        }
    }

    /// Like [`Self::generate`], but the key also carries a PGP
    /// fingerprint derived from the seed.
    pub fn with_fingerprint(seed: u8) -> Self {
        let mut key = Self::generate(seed);
        key.fingerprint = Some(Fingerprint::from_bytes([seed; 20]));
        key
    }

    /// The directory record for this key.
    pub fn server_key(&self) -> ServerKey {
        ServerKey {
            kid: self.kid.clone(),
            key_bytes: self.signing.verifying_key().to_bytes(),
            fingerprint: self.fingerprint,
        }
    }
}

/// A test chain owner.
pub struct TestUser {
    pub uid: Uid,
    pub username: String,
}

impl TestUser {
    pub fn new(username: &str) -> Self {
        let digest = sha256(username.as_bytes());
        let mut uid_bytes = [0u8; 16];
        uid_bytes.copy_from_slice(&digest[..16]);
        Self {
            uid: Uid::from_bytes(uid_bytes),
            username: username.to_string(),
        }
    }

    fn payload_value(
        &self,
        signer: &TestKey,
        seqno: Seqno,
        prev: Option<LinkId>,
        eldest_kid: Option<&Kid>,
        body: Value,
    ) -> Value {
        let mut payload = json!({
            "uid": self.uid.to_hex(),
            "username": self.username,
            "seqno": seqno.value(),
            "kid": signer.kid.to_hex(),
            "ctime": 1_700_000_000_i64 + i64::try_from(seqno.value()).expect("seqno fits"),
            "body": body,
        });
        if let Some(prev) = prev {
            payload["prev"] = json!(prev.to_hex());
        }
        if let Some(eldest_kid) = eldest_kid {
            payload["eldest_kid"] = json!(eldest_kid.to_hex());
        }
        if let Some(fingerprint) = &signer.fingerprint {
            payload["fingerprint"] = json!(fingerprint.to_hex());
        }
        payload
    }

    fn seal(signer: &TestKey, seqno: Seqno, payload: &Value) -> WireLink {
        let payload_bytes = serde_json::to_vec(payload).expect("encode payload");
        let signature = signer.signing.sign(&payload_bytes);
        let sig_bytes = signature.to_bytes();
        WireLink {
            seqno,
            payload: BASE64.encode(&payload_bytes),
            payload_hash: LinkId::from_bytes(sha256(&payload_bytes)),
            sig: BASE64.encode(sig_bytes),
            sig_id: SigId::from_bytes(sha256(&sig_bytes)),
            kid: signer.kid.clone(),
            merkle_path: None,
        }
    }

    /// A signed eldest link.
    pub fn eldest_link(&self, key: &TestKey, seqno: Seqno, prev: Option<LinkId>) -> WireLink {
        let body = json!({"type": "eldest", "kid": key.kid.to_hex()});
        let payload = self.payload_value(key, seqno, prev, None, body);
        Self::seal(key, seqno, &payload)
    }

    /// A signed sibkey delegation with a valid reverse signature.
    pub fn sibkey_link(
        &self,
        signer: &TestKey,
        delegate: &TestKey,
        seqno: Seqno,
        prev: Option<LinkId>,
    ) -> WireLink {
        self.sibkey_link_with_reverse_signer(signer, delegate, delegate, seqno, prev)
    }

    /// A sibkey delegation whose reverse signature is produced by
    /// `reverse_signer`; passing a key other than `delegate` forges it.
    pub fn sibkey_link_with_reverse_signer(
        &self,
        signer: &TestKey,
        delegate: &TestKey,
        reverse_signer: &TestKey,
        seqno: Seqno,
        prev: Option<LinkId>,
    ) -> WireLink {
        self.sibkey_link_full(signer, delegate, reverse_signer, seqno, prev, None)
    }

    fn sibkey_link_full(
        &self,
        signer: &TestKey,
        delegate: &TestKey,
        reverse_signer: &TestKey,
        seqno: Seqno,
        prev: Option<LinkId>,
        eldest_kid: Option<&Kid>,
    ) -> WireLink {
        let body = json!({
            "type": "sibkey",
            "kid": delegate.kid.to_hex(),
            "reverse_sig": Value::Null,
        });
        let mut payload = self.payload_value(signer, seqno, prev, eldest_kid, body);

        // The reverse signature covers the payload with the field nulled.
        let base = serde_json::to_vec(&payload).expect("encode reverse base");
        let reverse_sig = reverse_signer.signing.sign(&base);
        payload["body"]["reverse_sig"] = json!(BASE64.encode(reverse_sig.to_bytes()));

        Self::seal(signer, seqno, &payload)
    }

    fn subkey_link_full(
        &self,
        signer: &TestKey,
        delegate: &TestKey,
        seqno: Seqno,
        prev: Option<LinkId>,
        eldest_kid: Option<&Kid>,
    ) -> WireLink {
        let body = json!({"type": "subkey", "kid": delegate.kid.to_hex()});
        let payload = self.payload_value(signer, seqno, prev, eldest_kid, body);
        Self::seal(signer, seqno, &payload)
    }

    fn revoke_link_full(
        &self,
        signer: &TestKey,
        kids: &[&Kid],
        sig_ids: &[SigId],
        seqno: Seqno,
        prev: Option<LinkId>,
        eldest_kid: Option<&Kid>,
    ) -> WireLink {
        let body = json!({
            "type": "revoke",
            "kids": kids.iter().map(|k| k.to_hex()).collect::<Vec<_>>(),
            "sig_ids": sig_ids.iter().map(SigId::to_hex).collect::<Vec<_>>(),
        });
        let payload = self.payload_value(signer, seqno, prev, eldest_kid, body);
        Self::seal(signer, seqno, &payload)
    }

    fn device_link_full(
        &self,
        signer: &TestKey,
        device: Value,
        seqno: Seqno,
        prev: Option<LinkId>,
        eldest_kid: Option<&Kid>,
    ) -> WireLink {
        let body = json!({"type": "device", "device": device});
        let payload = self.payload_value(signer, seqno, prev, eldest_kid, body);
        Self::seal(signer, seqno, &payload)
    }

    /// Imports a wire link, panicking on failure.
    pub fn import(&self, wire: WireLink) -> ChainLink {
        ChainLink::import(wire).expect("import test link")
    }

    /// Builds a key family; the first key becomes the eldest.
    pub fn key_family(&self, keys: &[&TestKey]) -> KeyFamily {
        let mut family = KeyFamily::new();
        for key in keys {
            family.insert(key.server_key());
        }
        if let Some(first) = keys.first() {
            family.set_eldest(first.kid.clone());
        }
        family
    }
}

/// Incrementally builds a linked chain of wire links.
pub struct ChainBuilder<'a> {
    user: &'a TestUser,
    eldest_kid: Option<Kid>,
    next_seqno: u64,
    prev: Option<LinkId>,
    pub wires: Vec<WireLink>,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(user: &'a TestUser) -> Self {
        Self {
            user,
            eldest_kid: None,
            next_seqno: 1,
            prev: None,
            wires: Vec::new(),
        }
    }

    fn push(&mut self, wire: WireLink) {
        self.prev = Some(wire.payload_hash);
        self.next_seqno += 1;
        self.wires.push(wire);
    }

    fn seqno(&self) -> Seqno {
        Seqno::new(self.next_seqno)
    }

    /// Starts (or restarts, on rotation) a subchain under `key`.
    pub fn eldest(&mut self, key: &TestKey) -> &mut Self {
        let wire = self.user.eldest_link(key, self.seqno(), self.prev);
        self.eldest_kid = Some(key.kid.clone());
        self.push(wire);
        self
    }

    /// Appends a sibkey delegation signed by `signer`.
    pub fn sibkey(&mut self, signer: &TestKey, delegate: &TestKey) -> &mut Self {
        let eldest = self.eldest_kid.clone();
        let wire = self.user.sibkey_link_full(
            signer,
            delegate,
            delegate,
            self.seqno(),
            self.prev,
            eldest.as_ref(),
        );
        self.push(wire);
        self
    }

    /// Appends a subkey delegation signed by `signer`.
    pub fn subkey(&mut self, signer: &TestKey, delegate: &TestKey) -> &mut Self {
        let eldest = self.eldest_kid.clone();
        let wire =
            self.user
                .subkey_link_full(signer, delegate, self.seqno(), self.prev, eldest.as_ref());
        self.push(wire);
        self
    }

    /// Appends a revocation of kids and/or sig ids signed by `signer`.
    pub fn revoke(&mut self, signer: &TestKey, kids: &[&Kid], sig_ids: &[SigId]) -> &mut Self {
        let eldest = self.eldest_kid.clone();
        let wire = self.user.revoke_link_full(
            signer,
            kids,
            sig_ids,
            self.seqno(),
            self.prev,
            eldest.as_ref(),
        );
        self.push(wire);
        self
    }

    /// Appends a combined sibkey delegation that also revokes `revoked`,
    /// all in one link signed by `signer`.
    pub fn sibkey_and_revoke(
        &mut self,
        signer: &TestKey,
        delegate: &TestKey,
        revoked: &Kid,
    ) -> &mut Self {
        let eldest = self.eldest_kid.clone();
        let seqno = self.seqno();
        let body = json!({
            "type": "sibkey",
            "kid": delegate.kid.to_hex(),
            "reverse_sig": Value::Null,
        });
        let mut payload =
            self.user
                .payload_value(signer, seqno, self.prev, eldest.as_ref(), body);
        payload["revoke"] = json!({ "kids": [revoked.to_hex()] });

        let base = serde_json::to_vec(&payload).expect("encode reverse base");
        let reverse_sig = delegate.signing.sign(&base);
        payload["body"]["reverse_sig"] = json!(BASE64.encode(reverse_sig.to_bytes()));
        let wire = TestUser::seal(signer, seqno, &payload);
        self.push(wire);
        self
    }

    /// Appends a device-update link signed by `signer`.
    pub fn device(&mut self, signer: &TestKey, device: Value) -> &mut Self {
        let eldest = self.eldest_kid.clone();
        let wire =
            self.user
                .device_link_full(signer, device, self.seqno(), self.prev, eldest.as_ref());
        self.push(wire);
        self
    }

    /// Imports every built wire into chain links.
    pub fn links(&self) -> Vec<ChainLink> {
        self.wires
            .iter()
            .map(|wire| ChainLink::import(wire.clone()).expect("import built link"))
            .collect()
    }

    /// The built wires as JSON values, the shape `sig/get` returns.
    pub fn wire_values(&self) -> Vec<Value> {
        self.wires
            .iter()
            .map(|wire| serde_json::to_value(wire).expect("encode wire"))
            .collect()
    }

    /// Sig id of the built link at `index`.
    pub fn sig_id(&self, index: usize) -> SigId {
        self.wires[index].sig_id
    }

    /// The tail triple of the built chain.
    pub fn tail_triple(&self) -> crate::types::MerkleTriple {
        let wire = self.wires.last().expect("non-empty chain");
        crate::types::MerkleTriple::new(wire.seqno, wire.payload_hash, wire.sig_id)
    }
}

/// Canned-response API client.
pub struct FakeApi {
    responses: Mutex<VecDeque<Value>>,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
        }
    }

    /// Queues a raw body for the next request.
    pub fn push(&self, body: Value) {
        self.responses
            .lock()
            .expect("fake api mutex poisoned")
            .push_back(body);
    }

    /// Queues a `sig/get`-shaped response carrying `wires`.
    pub fn push_sigs(&self, wires: &[Value]) {
        self.push(json!({ "sigs": wires }));
    }
}

impl ApiClient for FakeApi {
    fn get(&self, cancel: &CancellationToken, _arg: &ApiArg) -> Result<ApiRes, ApiError> {
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        let body = self
            .responses
            .lock()
            .expect("fake api mutex poisoned")
            .pop_front()
            .ok_or_else(|| ApiError::Transport {
                reason: "no canned response queued".to_string(),
            })?;
        Ok(ApiRes::new(body))
    }
}

/// A context over an in-memory store, a fake API, and a manual clock.
pub fn test_context(api: Arc<FakeApi>) -> (Context, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(
        DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp"),
    ));
    let ctx = Context {
        store: Arc::new(SqliteStore::in_memory().expect("in-memory store")),
        api,
        clock: Arc::clone(&clock) as Arc<dyn crate::context::Clock>,
        cancel: CancellationToken::new(),
        config: ChainConfig::default(),
    };
    (ctx, clock)
}
