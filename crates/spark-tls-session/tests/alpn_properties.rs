//! ALPN 协商性质：结果只取决于两份报价，客户端顺序决定选择，服务端顺序无关。

use proptest::prelude::*;
use spark_tls_session::alpn::negotiate;

fn offer() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        prop::sample::select(vec!["h2", "http/1.1", "foo", "bar", "sip", "webrtc"]),
        0..5,
    )
    .prop_map(|names| names.into_iter().map(str::to_owned).collect())
}

proptest! {
    #[test]
    fn picks_first_client_entry_present_on_server(client in offer(), server in offer()) {
        let expected = client.iter().find(|name| server.contains(*name));
        prop_assert_eq!(negotiate(&client, &server), expected);
    }

    #[test]
    fn server_order_does_not_matter(client in offer(), server in offer()) {
        let mut reversed = server.clone();
        reversed.reverse();
        prop_assert_eq!(negotiate(&client, &server), negotiate(&client, &reversed));
    }

    #[test]
    fn empty_side_yields_none(offer in offer()) {
        let empty: Vec<String> = Vec::new();
        prop_assert_eq!(negotiate(&offer, &empty), None);
        prop_assert_eq!(negotiate(&empty, &offer), None);
    }

    #[test]
    fn result_is_always_shared(client in offer(), server in offer()) {
        if let Some(picked) = negotiate(&client, &server) {
            prop_assert!(client.contains(picked) && server.contains(picked));
        }
    }
}

#[test]
fn client_preference_beats_server_preference() {
    assert_eq!(negotiate(&["bar", "foo"], &["foo", "bar"]), Some(&"bar"));
}
