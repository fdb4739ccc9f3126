/// Group creation, membership and teardown across a client endpoint and
/// in-process servers.
mod common;

use common::{client, client_addr, connect, connect_with, init_tracing, Server};
use mrpc_multicast::{GroupSpec, McastHost, MulticastError};
use mrpc_transport::{
    ClientState, EncryptionType, GroupHandle, SecurityLevel, SecurityParams, ServerState,
    SessionKey,
};

fn dummy() -> GroupSpec {
    GroupSpec::new(McastHost::Dummy, 0)
}

#[tokio::test]
async fn open_group_starts_thinking() {
    init_tracing();
    let ep = client();

    let group = ep.create_group(dummy()).await.unwrap();
    let record = ep.group(group).unwrap();
    assert_eq!(record.client_state(), Some(ClientState::Think));
    assert_eq!(record.security().level, SecurityLevel::Open);
    assert_eq!(record.side_effect(), 0);
    assert_eq!(ep.stats().groups_allocated.get(), 1);
}

#[tokio::test]
async fn secure_group_with_two_ciphers_is_refused() {
    init_tracing();
    let ep = client();

    let spec = dummy().security(
        SecurityLevel::Secure,
        SessionKey([9; 32]),
        EncryptionType(EncryptionType::XOR.0 | EncryptionType::CHACHA20.0),
    );
    let err = ep.create_group(spec).await.unwrap_err();
    assert!(matches!(err, MulticastError::InvalidSecurityParameters { .. }));
    assert_eq!(ep.groups_in_use(), 0);
    assert_eq!(ep.stats().groups_allocated.get(), 0);
}

#[tokio::test]
async fn handles_are_distinct() {
    let ep = client();
    let a = ep.create_group(dummy()).await.unwrap();
    let b = ep.create_group(dummy()).await.unwrap();
    assert_ne!(a, b);
    assert_ne!(a, GroupHandle(0));
}

#[tokio::test]
async fn member_of_another_group_is_incompatible() {
    init_tracing();
    let ep = client();
    let server = Server::echo();
    let (conn, server_conn) = connect(&ep, &server, SecurityParams::open());

    let g2 = ep.create_group(dummy()).await.unwrap();
    ep.add_member(g2, conn).await.unwrap();
    let g1 = ep.create_group(dummy()).await.unwrap();

    let err = ep.add_member(g1, conn).await.unwrap_err();
    assert!(matches!(err, MulticastError::IncompatibleGroup { .. }));

    assert_eq!(ep.group(g2).unwrap().members(), &[conn]);
    assert!(ep.group(g1).unwrap().members().is_empty());
    assert_eq!(ep.group_of(conn).unwrap().handle(), g2);
    let bound = server.endpoint.group_of(server_conn).unwrap();
    assert_eq!(bound.handle(), g2);
}

#[tokio::test]
async fn add_member_binds_server_record() {
    let ep = client();
    let server = Server::echo();
    let (conn, server_conn) = connect_with(&ep, &server, SecurityParams::open(), 4);

    let group = ep
        .create_group(dummy().subsys_id(4))
        .await
        .unwrap();
    ep.add_member(group, conn).await.unwrap();

    let record = server
        .endpoint
        .server_group(Some(client_addr()), group)
        .unwrap();
    assert_eq!(record.bound_conn(), Some(server_conn));
    assert_eq!(record.server_state(), Some(ServerState::AwaitRequest));
    assert_eq!(record.subsys_id(), 4);
    assert_eq!(record.next_seq(), 0);
    assert_eq!(
        ep.connection(conn).unwrap().next_seq,
        server.endpoint.connection(server_conn).unwrap().next_seq
    );
    assert!(ep.verify_links().is_ok());
    assert!(server.endpoint.verify_links().is_ok());
}

#[tokio::test]
async fn second_add_is_duplicate_and_changes_nothing() {
    let ep = client();
    let server = Server::echo();
    let (conn, _) = connect(&ep, &server, SecurityParams::open());
    let group = ep.create_group(dummy()).await.unwrap();

    ep.add_member(group, conn).await.unwrap();
    let seq = ep.connection(conn).unwrap().next_seq;
    let err = ep.add_member(group, conn).await.unwrap_err();

    assert!(matches!(err, MulticastError::DuplicateMember { .. }));
    assert_eq!(ep.group(group).unwrap().members(), &[conn]);
    assert_eq!(ep.connection(conn).unwrap().next_seq, seq);
    assert_eq!(server.endpoint.stats().handshakes.get(), 1);
}

#[tokio::test]
async fn mismatched_security_is_incompatible() {
    let ep = client();
    let server = Server::echo();
    let conn_security =
        SecurityParams::new(SecurityLevel::Secure, SessionKey([1; 32]), EncryptionType::XOR)
            .unwrap();
    let (conn, _) = connect(&ep, &server, conn_security);

    let group = ep
        .create_group(dummy().security(
            SecurityLevel::Secure,
            SessionKey([2; 32]),
            EncryptionType::CHACHA20,
        ))
        .await
        .unwrap();
    let err = ep.add_member(group, conn).await.unwrap_err();
    assert!(matches!(err, MulticastError::IncompatibleGroup { .. }));
    assert!(ep.group(group).unwrap().is_idle());
    assert!(ep.connection(conn).unwrap().state.is_idle());
}

#[tokio::test]
async fn rebinding_from_same_client_evicts_first_connection() {
    init_tracing();
    let first_client = client();
    let second_client = client();
    let server = Server::echo();
    let (a, server_a) = connect(&first_client, &server, SecurityParams::open());
    let (b, server_b) = connect(&second_client, &server, SecurityParams::open());

    // Both clients share an address and their first group handle.
    let g_first = first_client.create_group(dummy()).await.unwrap();
    let g_second = second_client.create_group(dummy()).await.unwrap();
    assert_eq!(g_first, g_second);

    first_client.add_member(g_first, a).await.unwrap();
    assert!(server.endpoint.group_of(server_a).is_some());

    second_client.add_member(g_second, b).await.unwrap();
    assert!(server.endpoint.connection(server_a).unwrap().mgrp.is_none());
    let record = server
        .endpoint
        .server_group(Some(client_addr()), g_second)
        .unwrap();
    assert_eq!(record.bound_conn(), Some(server_b));
    assert_eq!(server.endpoint.groups_in_use(), 1);
    assert!(server.endpoint.verify_links().is_ok());
}

#[tokio::test]
async fn delete_group_detaches_members_locally() {
    let ep = client();
    let server = Server::echo();
    let (a, _) = connect(&ep, &server, SecurityParams::open());
    let (b, _) = connect(&ep, &server, SecurityParams::open());
    let group = ep.create_group(dummy()).await.unwrap();
    ep.add_member(group, a).await.unwrap();
    ep.add_member(group, b).await.unwrap();

    ep.delete_group(group).await.unwrap();
    assert!(ep.group(group).is_none());
    assert!(ep.connection(a).unwrap().mgrp.is_none());
    assert!(ep.connection(b).unwrap().mgrp.is_none());
    assert_eq!(ep.groups_in_use(), 0);
    assert_eq!(ep.stats().groups_freed.get(), 1);

    assert!(matches!(
        ep.delete_group(group).await,
        Err(MulticastError::NoSuchGroup(_))
    ));
}

#[tokio::test]
async fn freed_records_are_reused() {
    let ep = client();
    for _ in 0..4 {
        let group = ep.create_group(dummy()).await.unwrap();
        ep.delete_group(group).await.unwrap();
    }
    assert_eq!(ep.stats().pool_growth.get(), 1);
    assert_eq!(ep.stats().groups_allocated.get(), 4);
}

#[tokio::test]
async fn destroying_server_connection_deletes_its_group() {
    let ep = client();
    let server = Server::echo();
    let (conn, server_conn) = connect(&ep, &server, SecurityParams::open());
    let group = ep.create_group(dummy()).await.unwrap();
    ep.add_member(group, conn).await.unwrap();

    server.endpoint.destroy_connection(server_conn).unwrap();
    assert!(server
        .endpoint
        .server_group(Some(client_addr()), group)
        .is_none());
    assert_eq!(server.endpoint.groups_in_use(), 0);
    // The client's view is unaffected until it notices.
    assert_eq!(ep.group(group).unwrap().members(), &[conn]);
}
