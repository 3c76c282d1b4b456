use super::*;

fn sample_selection() -> Selection {
    Selection {
        channel_id: 12,
        channel_type: ChannelType::CodexOAuth,
        channel_groups: "default, vip".to_string(),
        route_group: "vip".to_string(),
        policy: ChannelPolicy {
            allow_service_tier: true,
            openai_organization: Some("org-123".to_string()),
            param_override: r#"{"temperature":0.2}"#.to_string(),
            ..Default::default()
        },
        endpoint_id: 40,
        base_url: "https://chatgpt.example.com/backend-api/codex".to_string(),
        credential_type: CredentialType::CodexOAuth,
        credential_id: 9,
    }
}

#[test]
fn test_credential_key_format() {
    let sel = sample_selection();
    assert_eq!(sel.credential_key(), "codex_oauth:9");
    assert_eq!(
        credential_key(CredentialType::OpenAICompatible, 3),
        "openai_compatible:3"
    );
}

#[test]
fn test_selection_json_round_trip() {
    let sel = sample_selection();
    let json = serde_json::to_string(&sel).unwrap();
    let back: Selection = serde_json::from_str(&json).unwrap();
    assert_eq!(back, sel);
}

#[test]
fn test_selection_json_is_flat() {
    let value = serde_json::to_value(sample_selection()).unwrap();
    assert_eq!(value["ChannelID"], 12);
    assert_eq!(value["ChannelType"], "codex_oauth");
    assert_eq!(value["BaseURL"], "https://chatgpt.example.com/backend-api/codex");
    assert_eq!(value["AllowServiceTier"], true);
    assert_eq!(value["OpenAIOrganization"], "org-123");
    assert_eq!(value["AutoBan"], true);
    assert!(value.get("policy").is_none());
}

#[test]
fn test_selection_missing_auto_ban_defaults_to_true() {
    let json = r#"{
        "ChannelID": 1,
        "ChannelType": "openai_compatible",
        "EndpointID": 2,
        "BaseURL": "https://api.example.com/v1",
        "CredentialType": "openai_compatible",
        "CredentialID": 3
    }"#;
    let sel: Selection = serde_json::from_str(json).unwrap();
    assert!(sel.policy.auto_ban);
    assert_eq!(sel.channel_groups, "");
}

#[test]
fn test_route_key_hash() {
    assert_eq!(route_key_hash(""), "");
    let hash = route_key_hash("conversation-1");
    assert_eq!(hash.len(), 64);
    assert_eq!(hash, route_key_hash("conversation-1"));
    assert_ne!(hash, route_key_hash("conversation-2"));
    // sha256("abc")
    assert_eq!(
        route_key_hash("abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

#[test]
fn test_channel_in_any_group() {
    let allowed: HashSet<String> = ["vip".to_string()].into_iter().collect();
    assert!(channel_in_any_group("default, vip", Some(&allowed)));
    assert!(!channel_in_any_group("default", Some(&allowed)));
    assert!(!channel_in_any_group("", Some(&allowed)));
    assert!(channel_in_any_group("", None));

    let empty = HashSet::new();
    assert!(!channel_in_any_group("vip", Some(&empty)));
}

#[test]
fn test_constraints_match_selection() {
    let sel = sample_selection();
    assert!(Constraints::default().matches_selection(&sel));
    assert!(
        Constraints::default()
            .with_channel_type(ChannelType::CodexOAuth)
            .with_channel_id(12)
            .matches_selection(&sel)
    );
    assert!(
        !Constraints::default()
            .with_channel_type(ChannelType::Anthropic)
            .matches_selection(&sel)
    );
    assert!(!Constraints::default().with_channel_id(13).matches_selection(&sel));
    assert!(
        !Constraints::default()
            .with_allow_groups(["other"])
            .matches_selection(&sel)
    );
    assert!(
        !Constraints::default()
            .with_allow_channel_ids([1, 2])
            .matches_selection(&sel)
    );
    assert!(
        Constraints::default()
            .with_allow_groups(["vip"])
            .with_allow_channel_ids([12])
            .matches_selection(&sel)
    );
}

#[test]
fn test_constraints_allows_group() {
    assert!(Constraints::default().allows_group("anything"));
    let cons = Constraints::default().with_allow_groups(["vip"]);
    assert!(cons.allows_group(" vip "));
    assert!(!cons.allows_group("default"));
    assert!(!cons.allows_group(""));
}

#[test]
fn test_error_class_parse_and_display() {
    for class in [
        ErrorClass::Network,
        ErrorClass::StreamIdleTimeout,
        ErrorClass::StreamMaxDuration,
        ErrorClass::UpstreamExhausted,
    ] {
        assert_eq!(class.as_str().parse::<ErrorClass>().unwrap(), class);
    }
    assert!("bogus".parse::<ErrorClass>().is_err());
    assert_eq!(ErrorClass::ReadUpstream.to_string(), "read_upstream");
    assert!(ErrorClass::ClientDisconnect.is_benign());
    assert!(!ErrorClass::StreamReadError.is_benign());
}

#[test]
fn test_attempt_result_for_stream() {
    assert!(AttemptResult::for_stream(200, None).success);
    assert!(AttemptResult::for_stream(200, Some(ErrorClass::ClientDisconnect)).success);
    assert!(AttemptResult::for_stream(200, Some(ErrorClass::StreamMaxDuration)).success);

    let idle = AttemptResult::for_stream(200, Some(ErrorClass::StreamIdleTimeout));
    assert!(!idle.success);
    assert!(idle.retriable);
    assert_eq!(idle.error_class, Some(ErrorClass::StreamIdleTimeout));

    let gone = AttemptResult::for_stream(502, Some(ErrorClass::ClientDisconnect));
    assert!(!gone.success);
    assert!(!gone.retriable);
}

#[test]
fn test_upstream_request_timeout() {
    let default = Duration::from_secs(60);
    let codex = sample_selection();
    assert_eq!(codex.upstream_request_timeout(false, default), None);

    let mut openai = sample_selection();
    openai.channel_type = ChannelType::OpenAICompatible;
    openai.credential_type = CredentialType::OpenAICompatible;
    assert_eq!(openai.upstream_request_timeout(false, default), Some(default));
    assert_eq!(openai.upstream_request_timeout(true, default), None);
}

#[test]
fn test_channel_type_parse() {
    assert_eq!(
        "anthropic".parse::<ChannelType>().unwrap(),
        ChannelType::Anthropic
    );
    assert_eq!(
        ChannelType::CodexOAuth.credential_type(),
        CredentialType::CodexOAuth
    );
    assert!("gemini".parse::<ChannelType>().is_err());
}
