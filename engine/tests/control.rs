use mixd_engine::arena::Handle;
use mixd_engine::chanmap::ChannelRange;
use mixd_engine::dev::DeviceParams;
use mixd_engine::fmt::Encoding;
use mixd_engine::init;
use mixd_engine::message::{Action, Event};
use mixd_engine::slot::{SlotMode, SlotParams, XrunPolicy};
use tokio::sync::mpsc::{Receiver, Sender, channel};

async fn setup() -> (Sender<Action>, Receiver<Event>, Handle) {
    let (tx, _engine) = init();
    let (etx, mut erx) = channel::<Event>(256);
    tx.send(Action::Subscribe(etx)).await.unwrap();
    tx.send(Action::OpenDevice(DeviceParams::default()))
        .await
        .unwrap();
    let dev = match erx.recv().await.unwrap() {
        Event::DeviceOpen { dev } => dev,
        other => panic!("unexpected {other:?}"),
    };
    (tx, erx, dev)
}

fn play_params(name: &str) -> SlotParams {
    SlotParams {
        name: name.to_string(),
        mode: SlotMode::Play,
        enc: Encoding::s16_ne(),
        rate: 48000,
        chan: ChannelRange::new(0, 1).unwrap(),
        dup: false,
        appbufsz: 960,
        xrun: XrunPolicy::Sync,
        mmc: false,
        vol: 127,
    }
}

async fn attach(tx: &Sender<Action>, erx: &mut Receiver<Event>, dev: Handle, name: &str) -> Handle {
    tx.send(Action::AttachSlot {
        dev,
        params: play_params(name),
    })
    .await
    .unwrap();
    loop {
        match erx.recv().await.unwrap() {
            Event::SlotAttached { slot } => return slot,
            Event::Error(e) => panic!("{e}"),
            _ => continue,
        }
    }
}

/// Start a slot and return the initial write credit.
async fn start(tx: &Sender<Action>, erx: &mut Receiver<Event>, slot: Handle) -> usize {
    tx.send(Action::SlotStart(slot)).await.unwrap();
    loop {
        match erx.recv().await.unwrap() {
            Event::SlotCredit { slot: s, bytes, .. } if s == slot => return bytes,
            Event::Error(e) => panic!("{e}"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn oversized_write_ends_only_the_offender() {
    let (tx, mut erx, dev) = setup().await;
    let good = attach(&tx, &mut erx, dev, "good").await;
    let bad = attach(&tx, &mut erx, dev, "bad").await;
    let good_credit = start(&tx, &mut erx, good).await;
    let bad_credit = start(&tx, &mut erx, bad).await;

    tx.send(Action::SlotData {
        slot: good,
        bytes: vec![0x11; good_credit],
    })
    .await
    .unwrap();
    // one frame more than the grant: protocol violation
    tx.send(Action::SlotData {
        slot: bad,
        bytes: vec![0x22; bad_credit + 4],
    })
    .await
    .unwrap();
    loop {
        match erx.recv().await.unwrap() {
            Event::SlotGone { slot, reason } => {
                assert_eq!(slot, bad);
                assert!(reason.contains("credit"), "{reason}");
                break;
            }
            Event::Error(e) => panic!("{e}"),
            _ => continue,
        }
    }

    // the sibling still runs cycles and gets credit back
    tx.send(Action::DeviceCycle(dev)).await.unwrap();
    loop {
        match erx.recv().await.unwrap() {
            Event::SlotCredit { slot, bytes, .. } => {
                assert_eq!(slot, good);
                assert_eq!(bytes, 480 * 4);
                break;
            }
            Event::SlotGone { slot, .. } => panic!("lost {slot:?}"),
            _ => continue,
        }
    }
    tx.send(Action::Quit).await.unwrap();
}

#[tokio::test]
async fn stopped_play_slot_drains_to_eof() {
    let (tx, mut erx, dev) = setup().await;
    let slot = attach(&tx, &mut erx, dev, "s").await;
    let credit = start(&tx, &mut erx, slot).await;
    tx.send(Action::SlotData {
        slot,
        bytes: vec![0; credit],
    })
    .await
    .unwrap();
    tx.send(Action::SlotStop(slot)).await.unwrap();
    // two buffered blocks drain over two cycles, then eof
    for _ in 0..3 {
        tx.send(Action::DeviceCycle(dev)).await.unwrap();
    }
    loop {
        match erx.recv().await.unwrap() {
            Event::SlotEof(s) => {
                assert_eq!(s, slot);
                break;
            }
            Event::Error(e) => panic!("{e}"),
            _ => continue,
        }
    }
    tx.send(Action::Quit).await.unwrap();
}

#[tokio::test]
async fn record_stream_delivers_loopback_audio() {
    let (tx, mut erx, dev) = setup().await;
    let player = attach(&tx, &mut erx, dev, "p").await;
    let credit = start(&tx, &mut erx, player).await;
    let mut bytes = Vec::with_capacity(credit);
    for _ in 0..credit / 2 {
        bytes.extend_from_slice(&4000i16.to_ne_bytes());
    }
    tx.send(Action::SlotData {
        slot: player,
        bytes,
    })
    .await
    .unwrap();

    let mut params = play_params("r");
    params.mode = SlotMode::Rec;
    tx.send(Action::AttachSlot { dev, params }).await.unwrap();
    let rec = loop {
        match erx.recv().await.unwrap() {
            Event::SlotAttached { slot } => break slot,
            _ => continue,
        }
    };
    tx.send(Action::SlotStart(rec)).await.unwrap();

    // the loopback echoes after bufsz frames of latency; drive cycles
    // one at a time, acking delivered data to keep the read window open
    let mut seen_signal = false;
    'cycles: for _ in 0..12 {
        tx.send(Action::DeviceCycle(dev)).await.unwrap();
        loop {
            match erx.recv().await.unwrap() {
                Event::SlotData { slot, bytes } => {
                    assert_eq!(slot, rec);
                    if bytes
                        .chunks_exact(2)
                        .any(|b| i16::from_ne_bytes([b[0], b[1]]) == 4000)
                    {
                        seen_signal = true;
                        break 'cycles;
                    }
                    tx.send(Action::SlotAck {
                        slot: rec,
                        bytes: bytes.len(),
                    })
                    .await
                    .unwrap();
                }
                Event::SlotGone { slot, reason } => panic!("lost {slot:?}: {reason}"),
                // the player's credit closes out each cycle's events
                Event::SlotCredit { slot, .. } if slot == player => break,
                _ => continue,
            }
        }
    }
    assert!(seen_signal, "record stream never carried the played audio");
    tx.send(Action::Quit).await.unwrap();
}

#[tokio::test]
async fn mmc_group_starts_atomically() {
    let (tx, mut erx, dev) = setup().await;
    let mut params_a = play_params("a");
    params_a.mmc = true;
    let mut params_b = play_params("b");
    params_b.mmc = true;
    tx.send(Action::AttachSlot {
        dev,
        params: params_a,
    })
    .await
    .unwrap();
    let a = loop {
        if let Event::SlotAttached { slot } = erx.recv().await.unwrap() {
            break slot;
        }
    };
    tx.send(Action::AttachSlot {
        dev,
        params: params_b,
    })
    .await
    .unwrap();
    let b = loop {
        if let Event::SlotAttached { slot } = erx.recv().await.unwrap() {
            break slot;
        }
    };
    let credit_a = start(&tx, &mut erx, a).await;
    let credit_b = start(&tx, &mut erx, b).await;

    // transport start with only one slot primed: nobody runs yet
    tx.send(Action::SlotData {
        slot: a,
        bytes: vec![0; credit_a],
    })
    .await
    .unwrap();
    tx.send(Action::Midi {
        dev,
        bytes: vec![0xF0, 0x7F, 0x7F, 0x06, 0x02, 0xF7],
    })
    .await
    .unwrap();
    tx.send(Action::DeviceCycle(dev)).await.unwrap();

    // priming the second slot releases the whole group at once
    tx.send(Action::SlotData {
        slot: b,
        bytes: vec![0; credit_b],
    })
    .await
    .unwrap();

    let mut running = vec![];
    let mut full_frame = false;
    for _ in 0..200 {
        match erx.recv().await.unwrap() {
            Event::SlotRunning(s) => {
                running.push(s);
                if running.len() == 2 {
                    break;
                }
            }
            Event::Midi { bytes, .. } => {
                if bytes.starts_with(&[0xF0, 0x7F]) {
                    full_frame = true;
                }
                assert!(running.is_empty() || running.len() == 2);
            }
            _ => continue,
        }
    }
    assert!(running.contains(&a) && running.contains(&b));
    assert!(full_frame, "transport start never announced its origin");

    // quarter-frame timecode flows once cycles run
    tx.send(Action::DeviceCycle(dev)).await.unwrap();
    let mut saw_qf = false;
    for _ in 0..50 {
        match erx.recv().await.unwrap() {
            Event::Midi { bytes, .. } if bytes.first() == Some(&0xF1) => {
                saw_qf = true;
                break;
            }
            _ => continue,
        }
    }
    assert!(saw_qf, "no quarter-frame timecode after transport start");
    tx.send(Action::Quit).await.unwrap();
}

#[tokio::test]
async fn closing_the_device_tears_every_slot_down() {
    let (tx, mut erx, dev) = setup().await;
    let slot = attach(&tx, &mut erx, dev, "s").await;
    start(&tx, &mut erx, slot).await;
    tx.send(Action::CloseDevice(dev)).await.unwrap();
    let mut slot_gone = false;
    let mut dev_gone = false;
    for _ in 0..50 {
        match erx.recv().await.unwrap() {
            Event::SlotGone { slot: s, .. } => {
                assert_eq!(s, slot);
                slot_gone = true;
            }
            Event::DeviceGone { dev: d, .. } => {
                assert_eq!(d, dev);
                dev_gone = true;
            }
            _ => continue,
        }
        if slot_gone && dev_gone {
            break;
        }
    }
    assert!(slot_gone && dev_gone);
    tx.send(Action::Quit).await.unwrap();
}
