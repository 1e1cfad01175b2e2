use super::*;

#[test]
fn media_kind_parses_case_insensitively() {
    assert_eq!("IMAGE".parse::<MediaKind>().unwrap(), MediaKind::Image);
    assert_eq!(" audio ".parse::<MediaKind>().unwrap(), MediaKind::Audio);
    assert!("document".parse::<MediaKind>().is_err());
}

#[test]
fn ids_serialize_as_bare_uuid_strings() {
    let id = UserId::new();
    let json = serde_json::to_value(id).expect("serialize");
    assert_eq!(json, serde_json::Value::String(id.0.to_string()));
    let parsed: UserId = id.to_string().parse().expect("parse");
    assert_eq!(parsed, id);
}
