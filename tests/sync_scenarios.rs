//! End-to-end scenarios for the synchronization engine, driven against
//! in-memory implementations of the storage engine and the remote peer.

mod common;

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use common::{
    remote_user_entry, test_agreement, user_entry, MemoryRemote, MemoryStore, RemoteOp,
    GENERATION, LOCAL_SUBTREE, REMOTE_SUBTREE,
};
use winsync::changelog::{OpPayload, OperationRecord};
use winsync::connection::ConnectionControl;
use winsync::entry::AttrMod;
use winsync::error::rc;
use winsync::events::EventSet;
use winsync::inbound;
use winsync::mapper;
use winsync::outbound::{self, UpdateResult};
use winsync::protocol::{SyncProtocol, WindowsIncProtocol};
use winsync::ruv::{Csn, Ruv};
use winsync::SyncEntry;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn add_op(uniqueid: &str, dn: &str, csn: Csn, entry: SyncEntry) -> OperationRecord {
    OperationRecord {
        uniqueid: uniqueid.to_owned(),
        dn: dn.to_owned(),
        csn,
        modifier: "cn=directory manager".to_owned(),
        payload: OpPayload::Add(entry),
    }
}

#[tokio::test]
async fn fresh_user_create_outbound() {
    init_logging();
    let agmt = test_agreement();
    let store = MemoryStore::new();
    let mut remote = MemoryRemote::new(agmt.clone());
    let remote_state = remote.state();
    remote.connect().await;

    let alice_dn = format!("uid=alice,{}", LOCAL_SUBTREE);
    let mut alice = user_entry(&alice_dn, "alice", "Alice", "Smith");
    alice.add_value(mapper::UNHASHED_PASSWORD_ATTR, "{clear}s3cret");
    store.seed_entry("u-alice", alice.clone());
    let csn = Csn::new(2000, 0, 1);
    store.push_change(add_op("u-alice", &alice_dn, csn, alice));

    let consumer_ruv = Ruv::new(GENERATION);
    let events = EventSet::new();
    let terminate = AtomicBool::new(false);
    let (result, sent) =
        outbound::send_updates(&agmt, &mut remote, &*store, &consumer_ruv, &events, &terminate)
            .await;
    assert_eq!(result, UpdateResult::NoMoreUpdates);
    assert_eq!(sent, 1);

    let state = remote_state.lock().expect("state");
    let expected_dn = format!("cn=Alice,{}", REMOTE_SUBTREE);

    // The add carries the remote objectclasses, the UPN and the mapped
    // account name; the password is not part of it.
    let add = state
        .log
        .iter()
        .find_map(|op| match op {
            RemoteOp::Add { dn, attrs } => Some((dn.clone(), attrs.clone())),
            _ => None,
        })
        .expect("an add was sent");
    assert_eq!(add.0, expected_dn);
    let attr = |name: &str| {
        add.1
            .iter()
            .find(|(attr, _)| attr.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.clone())
    };
    let classes = attr("objectclass").expect("objectclass");
    for oc in ["top", "person", "organizationalPerson", "user"] {
        assert!(classes.iter().any(|v| v.eq_ignore_ascii_case(oc)), "missing {}", oc);
    }
    assert_eq!(attr("userPrincipalName").as_deref(), Some(&["alice@ad.example.com".to_owned()][..]));
    assert_eq!(attr("sAMAccountName").as_deref(), Some(&["alice".to_owned()][..]));
    assert!(attr(mapper::UNHASHED_PASSWORD_ATTR).is_none());

    // The password follows as a quoted UTF-16LE unicodePwd replace.
    let pw = state
        .log
        .iter()
        .find_map(|op| match op {
            RemoteOp::ModifyBin { dn, attr, value } => Some((dn.clone(), attr.clone(), value.clone())),
            _ => None,
        })
        .expect("a password modify was sent");
    assert_eq!(pw.0, expected_dn);
    assert!(pw.1.eq_ignore_ascii_case("unicodePwd"));
    assert_eq!(pw.2, mapper::encode_unicode_pwd("s3cret"));
    assert_eq!(
        state.passwords.get(&winsync::dn::normalize(&expected_dn)).map(String::as_str),
        Some("s3cret")
    );

    // And the account is flipped to a normal, enabled account.
    let acct = state
        .log
        .iter()
        .find_map(|op| match op {
            RemoteOp::Modify { dn, mods } => mods
                .iter()
                .find(|m| m.attr.eq_ignore_ascii_case("userAccountControl"))
                .map(|m| (dn.clone(), m.values.clone())),
            _ => None,
        })
        .expect("a userAccountControl modify was sent");
    assert_eq!(acct.0, expected_dn);
    assert_eq!(acct.1, ["512"]);
    drop(state);

    // The pass advanced the consumer's vector past the replayed CSN.
    let saved = store.consumer_ruv(&agmt.long_name()).expect("consumer ruv saved");
    assert!(saved.covers(csn));
}

#[tokio::test]
async fn inbound_tombstone_deletes_local_entry() {
    init_logging();
    let agmt = test_agreement();
    let store = MemoryStore::new();
    let mut remote = MemoryRemote::new(agmt.clone());
    remote.connect().await;

    // The GUID inside a tombstone DN is byte-shuffled; the local entry
    // stores the canonical order.
    let dashed = "d4ca4e16-e35b-400d-834a-f02db600f3fa";
    let stored_guid = mapper::permute_guid(&mapper::dedash_guid(dashed));
    let bob_dn = format!("uid=bob,{}", LOCAL_SUBTREE);
    let mut bob = user_entry(&bob_dn, "bob", "Bob", "Jones");
    bob.add_value("ntUniqueId", &stored_guid);
    store.seed_entry("u-bob", bob);

    let tombstone_dn = format!(
        "CN=Bob\\0ADEL:{},CN=Deleted Objects,DC=ad,DC=example,DC=com",
        dashed
    );
    let mut tombstone = SyncEntry::new(&tombstone_dn);
    tombstone.add_value("isDeleted", "TRUE");
    remote.state().lock().expect("state").dirsync_batches = vec![vec![tombstone]];

    assert!(inbound::dirsync_run(&agmt, &mut remote, &*store).await);
    assert!(!store.has_entry(&bob_dn), "local peer of the tombstone must be deleted");
    // The cookie advanced with the pass.
    assert!(agmt.cookie().is_some());
    assert!(!agmt.dirsync_has_more());
}

#[tokio::test]
async fn inbound_attribute_convergence() {
    init_logging();
    let agmt = test_agreement();
    let store = MemoryStore::new();
    let mut remote = MemoryRemote::new(agmt.clone());
    remote.connect().await;

    let alice_dn = format!("uid=alice,{}", LOCAL_SUBTREE);
    let mut alice = user_entry(&alice_dn, "alice", "Alice", "Smith");
    alice.add_value("telephoneNumber", "+1-444");
    store.seed_entry("u-alice", alice);

    let remote_dn = format!("cn=Alice,{}", REMOTE_SUBTREE);
    let mut remote_alice = remote_user_entry(&remote_dn, "alice", &[0x11; 16]);
    remote_alice.add_value("telephoneNumber", "+1-555");
    remote_alice.add_value("description", "hi");
    {
        let state_handle = remote.state();
        let mut state = state_handle.lock().expect("state");
        state.entries.push(remote_alice.clone());
        state.dirsync_batches = vec![vec![remote_alice]];
    }

    assert!(inbound::dirsync_run(&agmt, &mut remote, &*store).await);

    let local = store.entry(&alice_dn).expect("local entry still present");
    // Single-valued on the remote side: replaced, not merged.
    assert_eq!(local.attr_values("telephoneNumber"), ["+1-555"]);
    assert_eq!(local.attr_values("description"), ["hi"]);
}

#[tokio::test]
async fn rename_via_modrdn() {
    init_logging();
    let agmt = test_agreement();
    let store = MemoryStore::new();
    let mut remote = MemoryRemote::new(agmt.clone());
    let remote_state = remote.state();
    remote.connect().await;

    let guid = [0x42u8; 16];
    let guid_hex = mapper::guid_to_hex(&guid);

    // Locally the rename has already been applied: uid=carol became
    // uid=carla and the cn is now Carla.
    let carla_dn = format!("uid=carla,{}", LOCAL_SUBTREE);
    let mut carla = user_entry(&carla_dn, "carol", "Carla", "Young");
    carla.set_values("uid", vec!["carla".into()]);
    carla.add_value("ntUniqueId", &guid_hex);
    store.seed_entry("u-carol", carla);

    let remote_dn = format!("cn=Carol,{}", REMOTE_SUBTREE);
    let mut remote_carol = remote_user_entry(&remote_dn, "carol", &guid);
    remote_carol.add_value("cn", "Carol");
    remote_state.lock().expect("state").entries.push(remote_carol);

    let orig_dn = format!("uid=carol,{}", LOCAL_SUBTREE);
    let csn = Csn::new(2100, 0, 1);
    store.push_change(OperationRecord {
        uniqueid: "u-carol".to_owned(),
        dn: orig_dn,
        csn,
        modifier: "cn=directory manager".to_owned(),
        payload: OpPayload::ModRdn {
            new_rdn: "uid=carla".to_owned(),
            delete_old_rdn: true,
            new_superior: None,
        },
    });

    let consumer_ruv = Ruv::new(GENERATION);
    let events = EventSet::new();
    let terminate = AtomicBool::new(false);
    let (result, sent) =
        outbound::send_updates(&agmt, &mut remote, &*store, &consumer_ruv, &events, &terminate)
            .await;
    assert_eq!(result, UpdateResult::NoMoreUpdates);
    assert_eq!(sent, 1);

    let state = remote_state.lock().expect("state");
    let rename = state
        .log
        .iter()
        .find_map(|op| match op {
            RemoteOp::Rename { dn, new_rdn, new_superior, delete_old_rdn } => {
                Some((dn.clone(), new_rdn.clone(), new_superior.clone(), *delete_old_rdn))
            }
            _ => None,
        })
        .expect("a rename was sent");
    assert_eq!(rename.0, remote_dn);
    assert_eq!(rename.1, "cn=Carla");
    assert_eq!(rename.2.as_deref(), Some(REMOTE_SUBTREE));
    assert!(rename.3, "deleteoldrdn must be preserved");
    // The peer entry is now anchored on the new cn.
    assert!(state.entries.iter().any(|e| e.dn() == format!("cn=Carla,{}", REMOTE_SUBTREE)));
}

#[tokio::test]
async fn backoff_on_transient_failure_keeps_ruv_position() {
    init_logging();
    let agmt = test_agreement();
    let store = MemoryStore::new();
    let mut remote = MemoryRemote::new(agmt.clone());
    let remote_state = remote.state();
    remote.connect().await;

    let dave_dn = format!("uid=dave,{}", LOCAL_SUBTREE);
    let dave = user_entry(&dave_dn, "dave", "Dave", "Miller");
    store.seed_entry("u-dave", dave.clone());
    let csn = Csn::new(2200, 0, 1);
    store.push_change(add_op("u-dave", &dave_dn, csn, dave));

    remote_state.lock().expect("state").fail_next_update = Some(rc::SERVER_DOWN);

    let consumer_ruv = Ruv::new(GENERATION);
    let events = EventSet::new();
    let terminate = AtomicBool::new(false);
    let (result, sent) =
        outbound::send_updates(&agmt, &mut remote, &*store, &consumer_ruv, &events, &terminate)
            .await;
    // A disconnect-worthy failure ends the pass; the driver maps this to
    // the backoff path.
    assert_eq!(result, UpdateResult::ConnectionLost);
    assert_eq!(sent, 0);
    assert!(!remote_state.lock().expect("state").connected);

    // No RUV advance for the failed operation: the change replays on the
    // next session.
    let saved = store.consumer_ruv(&agmt.long_name()).expect("consumer ruv saved");
    assert!(!saved.covers(csn));
}

#[tokio::test]
async fn password_already_current_short_circuit() {
    init_logging();
    let agmt = test_agreement();
    let store = MemoryStore::new();
    let mut remote = MemoryRemote::new(agmt.clone());
    let remote_state = remote.state();
    remote.connect().await;

    let guid = [0x07u8; 16];
    let alice_dn = format!("uid=alice,{}", LOCAL_SUBTREE);
    let mut alice = user_entry(&alice_dn, "alice", "Alice", "Smith");
    alice.add_value("ntUniqueId", &mapper::guid_to_hex(&guid));
    store.seed_entry("u-alice", alice);

    let remote_dn = format!("cn=Alice,{}", REMOTE_SUBTREE);
    let mut remote_alice = remote_user_entry(&remote_dn, "alice", &guid);
    remote_alice.add_value("cn", "Alice");
    {
        let mut state = remote_state.lock().expect("state");
        state.entries.push(remote_alice);
        // The peer already took this password change directly.
        state
            .passwords
            .insert(winsync::dn::normalize(&remote_dn), "s3cret".to_owned());
    }

    let csn = Csn::new(2300, 0, 1);
    store.push_change(OperationRecord {
        uniqueid: "u-alice".to_owned(),
        dn: alice_dn,
        csn,
        modifier: "cn=directory manager".to_owned(),
        payload: OpPayload::Modify(vec![AttrMod::replace(
            mapper::UNHASHED_PASSWORD_ATTR,
            vec!["{clear}s3cret".into()],
        )]),
    });

    let consumer_ruv = Ruv::new(GENERATION);
    let events = EventSet::new();
    let terminate = AtomicBool::new(false);
    let (result, sent) =
        outbound::send_updates(&agmt, &mut remote, &*store, &consumer_ruv, &events, &terminate)
            .await;
    assert_eq!(result, UpdateResult::NoMoreUpdates);
    assert_eq!(sent, 1);

    // The probe bind succeeded, so no unicodePwd modify went out.
    let state = remote_state.lock().expect("state");
    assert!(
        !state.log.iter().any(|op| matches!(op, RemoteOp::ModifyBin { .. })),
        "no password modify may be issued when the peer already has the password"
    );
}

#[tokio::test]
async fn outbound_add_reanimates_remote_tombstone() {
    init_logging();
    let agmt = test_agreement();
    let store = MemoryStore::new();
    let mut remote = MemoryRemote::new(agmt.clone());
    let remote_state = remote.state();
    remote.connect().await;

    // The local entry remembers a GUID, but the remote peer was deleted:
    // only its tombstone remains.
    let guid_hex = "0123456789abcdef0123456789abcdef";
    let alice_dn = format!("uid=alice,{}", LOCAL_SUBTREE);
    let mut alice = user_entry(&alice_dn, "alice", "Alice", "Smith");
    alice.add_value("ntUniqueId", guid_hex);
    store.seed_entry("u-alice", alice.clone());

    let tombstone_guid = mapper::dash_guid(&mapper::permute_guid(guid_hex)).expect("dashed");
    let tombstone_dn = format!(
        "cn=Alice\\0ADEL:{},cn=Deleted Objects,dc=ad,dc=example,dc=com",
        tombstone_guid
    );
    let mut tombstone = SyncEntry::new(&tombstone_dn);
    tombstone.add_value("isDeleted", "TRUE");
    tombstone.add_value("samAccountName", "alice");
    remote_state.lock().expect("state").tombstones.push(tombstone);

    let csn = Csn::new(2500, 0, 1);
    store.push_change(add_op("u-alice", &alice_dn, csn, alice));

    let consumer_ruv = Ruv::new(GENERATION);
    let events = EventSet::new();
    let terminate = AtomicBool::new(false);
    let (result, sent) =
        outbound::send_updates(&agmt, &mut remote, &*store, &consumer_ruv, &events, &terminate)
            .await;
    assert_eq!(result, UpdateResult::NoMoreUpdates);
    assert_eq!(sent, 1);

    let state = remote_state.lock().expect("state");
    let reanimated_dn = format!("cn=Alice,{}", REMOTE_SUBTREE);
    let reanimate = state
        .log
        .iter()
        .find_map(|op| match op {
            RemoteOp::Reanimate { tombstone_dn, new_dn } => {
                Some((tombstone_dn.clone(), new_dn.clone()))
            }
            _ => None,
        })
        .expect("a reanimation was attempted");
    assert_eq!(reanimate.0, tombstone_dn);
    assert_eq!(reanimate.1, reanimated_dn);
    // No plain add was issued; the tombstone came back to life instead.
    assert!(!state.log.iter().any(|op| matches!(op, RemoteOp::Add { .. })));
    let revived = state
        .entries
        .iter()
        .find(|e| e.dn() == reanimated_dn)
        .expect("revived entry");
    assert!(!revived.has_attr("isDeleted"));
}

#[tokio::test]
async fn inbound_move_out_of_scope_unsyncs_local_entry() {
    init_logging();
    let agmt = test_agreement();
    agmt.reconfigure(|config| config.move_action = winsync::MoveAction::Unsync);
    agmt.consume_changed();
    let store = MemoryStore::new();
    let mut remote = MemoryRemote::new(agmt.clone());
    remote.connect().await;

    let guid = [0x55u8; 16];
    let eve_dn = format!("uid=eve,{}", LOCAL_SUBTREE);
    let mut eve = user_entry(&eve_dn, "eve", "Eve", "Adams");
    eve.add_value("ntUniqueId", &mapper::guid_to_hex(&guid));
    store.seed_entry("u-eve", eve);

    // The remote peer was moved out of the synchronized subtree.
    let moved_dn = "cn=Eve,ou=Contractors,dc=ad,dc=example,dc=com";
    let moved = remote_user_entry(moved_dn, "eve", &guid);
    remote.state().lock().expect("state").dirsync_batches = vec![vec![moved]];

    assert!(inbound::dirsync_run(&agmt, &mut remote, &*store).await);

    let local = store.entry(&eve_dn).expect("entry stays in place");
    assert!(!local.has_objectclass("ntUser"), "sync objectclass must be stripped");
    assert!(!local.has_attr("ntUserDomainId"));
    assert!(!local.has_attr("ntUniqueId"));
    // The rest of the entry is untouched.
    assert_eq!(local.first_value("uid"), Some("eve"));
    assert_eq!(local.first_value("sn"), Some("Adams"));
}

#[tokio::test(flavor = "multi_thread")]
async fn driver_replays_changes_and_stops_gracefully() {
    init_logging();
    let agmt = test_agreement();
    let store = MemoryStore::new();
    let remote = MemoryRemote::new(agmt.clone());
    let remote_state = remote.state();

    let alice_dn = format!("uid=alice,{}", LOCAL_SUBTREE);
    let alice = user_entry(&alice_dn, "alice", "Alice", "Smith");
    store.seed_entry("u-alice", alice.clone());
    let csn = Csn::new(2400, 0, 1);
    store.push_change(add_op("u-alice", &alice_dn, csn, alice));
    store.set_consumer_ruv(&agmt.long_name(), Ruv::new(GENERATION));

    let mut protocol = WindowsIncProtocol::new(agmt.clone(), store.clone(), remote);
    let handle = protocol.handle();
    let runner = tokio::spawn(async move { protocol.run().await });

    // Wait for the driver to work through the session.
    let mut sent = false;
    for _ in 0..100 {
        if remote_state
            .lock()
            .expect("state")
            .log
            .iter()
            .any(|op| matches!(op, RemoteOp::Add { .. }))
        {
            sent = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(sent, "driver never replayed the add");

    assert!(handle.stop().await, "shutdown must be graceful");
    assert!(handle.is_stopped());
    runner.await.expect("runner joined");

    let saved = store.consumer_ruv(&agmt.long_name()).expect("consumer ruv saved");
    assert!(saved.covers(csn));
}

#[tokio::test(flavor = "multi_thread")]
async fn driver_runs_dirsync_on_request_and_persists_cookie() {
    init_logging();
    let agmt = test_agreement();
    let store = MemoryStore::new();
    let remote = MemoryRemote::new(agmt.clone());
    let remote_state = remote.state();

    // Nothing to push; the consumer starts in sync with the supplier.
    store.set_consumer_ruv(&agmt.long_name(), Ruv::new(GENERATION));

    let remote_dn = format!("cn=Dave,{}", REMOTE_SUBTREE);
    let mut remote_dave = remote_user_entry(&remote_dn, "dave", &[0x33; 16]);
    remote_dave.add_value("sn", "Miller");
    {
        let mut state = remote_state.lock().expect("state");
        state.entries.push(remote_dave.clone());
        state.dirsync_batches = vec![vec![remote_dave]];
    }

    let mut protocol = WindowsIncProtocol::new(agmt.clone(), store.clone(), remote);
    let handle = protocol.handle();
    let runner = tokio::spawn(async move { protocol.run().await });

    handle.run_dirsync();

    let expected_local = format!("uid=dave,{}", LOCAL_SUBTREE);
    let mut created = false;
    for _ in 0..100 {
        if store.has_entry(&expected_local) {
            created = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(created, "dirsync pass never created the local entry");

    // Exactly one cookie was persisted for the successful pass.
    let mut cookie_saved = false;
    for _ in 0..100 {
        if store.cookie(&agmt.long_name()).is_some() {
            cookie_saved = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(cookie_saved, "dirsync cookie was not persisted");

    let local = store.entry(&expected_local).expect("created entry");
    assert!(local.has_objectclass("ntUser"));
    assert_eq!(local.first_value("uid"), Some("dave"));
    assert_eq!(local.first_value("ntUniqueId").map(str::to_owned), Some(mapper::guid_to_hex(&[0x33; 16])));

    assert!(handle.stop().await);
    runner.await.expect("runner joined");
}
