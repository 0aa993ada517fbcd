use nfc_mrtd::ErrorKind;
use nfc_mrtd::adapter::{AdapterKind, ReaderAdapter};
use nfc_mrtd::adapter::mock::{MockAdapter, SimulatedTag};
use nfc_mrtd::config::EngineConfig;
use nfc_mrtd::engine::{ChannelObserver, Engine, EngineEvent};
use nfc_mrtd::tag::TagType;
use nfc_mrtd::tag::ndef::Record;
use nfc_mrtd::tag::reader::TagContent;
use nfc_mrtd::tag::writer::{LockOptions, WriteRequest};


fn started(config: EngineConfig) -> Engine<MockAdapter> {
    let mut engine = Engine::new(MockAdapter::new(), config).unwrap();
    engine.start().unwrap();
    engine.process_pending().unwrap();
    engine
}


#[test]
fn test_config_selects_mock() {
    let config = EngineConfig::from_toml_str("adapter = \"mock\"\nauto_read = false\n").unwrap();
    assert_eq!(config.adapter, AdapterKind::Mock);
    let adapter = nfc_mrtd::adapter::from_config(&config).unwrap();
    assert_eq!(adapter.kind(), AdapterKind::Mock);

    let mut engine = Engine::new(adapter, config).unwrap();
    engine.start().unwrap();
    assert_eq!(engine.process_pending().unwrap(), 1);
}


#[test]
fn test_ndef_write_then_read() {
    let mut engine = started(EngineConfig { auto_read: false, ..EngineConfig::default() });
    let uid = vec![0x04, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6];
    let tag = SimulatedTag::type2(TagType::Ntag215, uid.clone(), &[]).unwrap();
    engine.adapter_mut().place_tag(tag);
    engine.process_pending().unwrap();

    let records = vec![
        Record::uri("https://example.com/"),
        Record::text("bonjour", "fr").unwrap(),
    ];
    engine.write_tag(&uid, &WriteRequest::Ndef(records.clone())).unwrap();

    match engine.read_tag(&uid).unwrap() {
        TagContent::Type2 { ndef, capability_container, .. } => {
            assert_eq!(ndef, Some(Ok(records.clone())));
            assert!(capability_container.is_some());
        },
        other => panic!("unexpected content {:?}", other),
    }
    assert_eq!(engine.tag(&uid).unwrap().ndef_records, Some(records));
}


#[test]
fn test_locked_tag_refuses_writes() {
    let mut engine = started(EngineConfig { auto_read: false, ..EngineConfig::default() });
    let (observer, events) = ChannelObserver::new();
    engine.add_observer(observer);

    let uid = vec![0x04, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6];
    let tag = SimulatedTag::type2(TagType::Ntag213, uid.clone(), &[]).unwrap();
    engine.adapter_mut().place_tag(tag);
    engine.process_pending().unwrap();

    engine.lock_tag(&uid, &LockOptions::default()).unwrap();
    assert!(engine.tag(&uid).unwrap().is_locked);

    let error = engine.write_tag(&uid, &WriteRequest::Ndef(vec![Record::uri("https://example.org/")]))
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidRequest);
    let reported = events.try_iter()
        .any(|event| matches!(event, EngineEvent::Error { uid: Some(ref failed), .. } if *failed == uid));
    assert!(reported);
}


#[test]
fn test_classic_blocks_and_format() {
    let mut engine = started(EngineConfig { auto_read: false, ..EngineConfig::default() });
    let uid = vec![0xC1, 0xC2, 0xC3, 0xC4];
    engine.adapter_mut().place_tag(SimulatedTag::classic_1k(uid.clone()));
    engine.process_pending().unwrap();

    let data = vec![0x5A; 16];
    engine.write_tag(&uid, &WriteRequest::Blocks(vec![(4, data.clone()), (8, data.clone())])).unwrap();
    assert_eq!(engine.adapter().tag(&uid).unwrap().block(4), Some(data.as_slice()));
    assert_eq!(engine.adapter().tag(&uid).unwrap().block(8), Some(data.as_slice()));

    // sector trailers are only changed by locking
    let error = engine.write_tag(&uid, &WriteRequest::Blocks(vec![(7, data.clone())])).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidRequest);

    engine.format_tag(&uid).unwrap();
    assert_eq!(engine.adapter().tag(&uid).unwrap().block(4), Some(&[0u8; 16][..]));
}


#[test]
fn test_operations_after_removal() {
    let mut engine = started(EngineConfig { auto_read: false, ..EngineConfig::default() });
    let uid = vec![0xD1, 0xD2, 0xD3, 0xD4];
    engine.adapter_mut().place_tag(SimulatedTag::classic_1k(uid.clone()));
    engine.process_pending().unwrap();
    engine.adapter_mut().remove_tag(&uid);
    engine.process_pending().unwrap();

    let error = engine.read_tag(&uid).unwrap_err();
    assert!(error.is_card_removed());
    assert_eq!(error.kind(), ErrorKind::Transport);
}
