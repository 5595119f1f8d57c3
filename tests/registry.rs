use std::collections::HashSet;

use hi3_stream_decoder::{Error, PortList, StreamHandle, StreamItem, StreamRegistry, StreamValue, MAX_STREAMS};

#[test]
fn exhaustion_and_reuse() {
    let reg = StreamRegistry::new();
    let handles: Vec<StreamHandle> = (0..MAX_STREAMS).map(|i| reg.create(&format!("id-{}", i), 5000).unwrap()).collect();

    let raw: HashSet<u32> = handles.iter().map(|h| h.get()).collect();
    assert_eq!(raw.len(), MAX_STREAMS);
    assert_eq!(raw.iter().min(), Some(&1));
    assert_eq!(raw.iter().max(), Some(&(MAX_STREAMS as u32)));
    assert_eq!(reg.live_count(), MAX_STREAMS);

    assert_eq!(reg.create("one-too-many", 5000), Err(Error::RegistryFull));

    reg.release(StreamHandle::from_raw(1)).unwrap();
    let again = reg.create("reused", 5000).unwrap();
    assert_eq!(again.get(), 1);
    assert_eq!(
        reg.get_info(again, StreamItem::InterceptPointId).unwrap(),
        StreamValue::Id("reused".to_string())
    );
}

#[test]
fn bad_handles() {
    let reg = StreamRegistry::new();
    assert_eq!(reg.release(StreamHandle::from_raw(0)), Err(Error::InvalidHandle(0)));
    assert_eq!(reg.release(StreamHandle::from_raw(257)), Err(Error::InvalidHandle(257)));

    let h = reg.create("x", 80).unwrap();
    reg.release(h).unwrap();
    assert_eq!(reg.release(h), Err(Error::InvalidHandle(h.get())));
    assert_eq!(reg.get_info(h, StreamItem::AsnIndex), Err(Error::InvalidHandle(h.get())));
    assert_eq!(reg.live_count(), 0);
}

#[test]
fn create_validates_arguments() {
    let reg = StreamRegistry::new();
    assert!(matches!(reg.create("", 80), Err(Error::InvalidArgument(_))));
    assert!(matches!(reg.create("id", 0), Err(Error::InvalidArgument(_))));
    assert_eq!(reg.live_count(), 0);
}

#[test]
fn round_robin_allocation() {
    let reg = StreamRegistry::new();
    let a = reg.create("a", 1).unwrap();
    reg.release(a).unwrap();
    let b = reg.create("b", 1).unwrap();
    assert_ne!(a, b);
    assert_eq!(reg.live_handles(), vec![b]);
}

#[test]
fn stream_info_items() {
    let reg = StreamRegistry::new();
    let h = reg.create("IPID-0001", 5000).unwrap();

    assert_eq!(reg.get_info(h, StreamItem::DestPort(0)).unwrap(), StreamValue::Port(5000));
    assert_eq!(reg.get_info(h, StreamItem::DestPort(1)).unwrap(), StreamValue::Port(0));
    assert!(matches!(reg.get_info(h, StreamItem::DestPort(8)), Err(Error::InvalidArgument(_))));

    reg.set_info(h, StreamItem::DestPort(1), StreamValue::Port(5001)).unwrap();
    let StreamValue::Ports(list) = reg.get_info(h, StreamItem::DestPortList).unwrap() else {
        panic!("expected a port list");
    };
    assert_eq!(list.iter().collect::<Vec<_>>(), vec![5000, 5001]);

    let replaced: PortList = [7000, 7001, 7000].into_iter().collect();
    reg.set_info(h, StreamItem::DestPortList, StreamValue::Ports(replaced)).unwrap();
    assert_eq!(reg.get_info(h, StreamItem::DestPort(0)).unwrap(), StreamValue::Port(7000));
    assert_eq!(reg.get_info(h, StreamItem::DestPort(2)).unwrap(), StreamValue::Port(0));

    reg.set_info(h, StreamItem::InterceptPointId, StreamValue::Id("IPID-0002".into())).unwrap();
    assert_eq!(
        reg.get_info(h, StreamItem::InterceptPointId).unwrap(),
        StreamValue::Id("IPID-0002".into())
    );
    assert!(matches!(
        reg.set_info(h, StreamItem::InterceptPointId, StreamValue::Id(String::new())),
        Err(Error::InvalidArgument(_))
    ));

    reg.set_info(h, StreamItem::AsnIndex, StreamValue::Index(0)).unwrap();
    assert_eq!(reg.get_info(h, StreamItem::CcPacketCount).unwrap(), StreamValue::Count(0));

    let err = reg.set_info(h, StreamItem::AsnIndex, StreamValue::Port(1)).unwrap_err();
    assert_eq!(err, Error::InvalidStreamItem("AsnIndex"));
    assert_eq!(err.code(), -11);
}

#[test]
fn port_list_limits() {
    let mut list = PortList::new();
    assert!(list.is_empty());
    for p in 1..=8 {
        assert!(list.insert(p));
    }
    assert!(list.insert(3));
    assert!(!list.insert(9));
    assert!(!list.insert(0));
    assert!(!list.contains(0));
    assert_eq!(list.iter().count(), 8);
}

#[test]
fn concurrent_create_and_release() {
    let reg = StreamRegistry::new();
    std::thread::scope(|s| {
        for t in 0..8 {
            let reg = &reg;
            s.spawn(move || {
                for i in 0..20 {
                    let h = reg.create(&format!("t{}-{}", t, i), 5000).unwrap();
                    reg.release(h).unwrap();
                }
            });
        }
    });
    assert_eq!(reg.live_count(), 0);
}
