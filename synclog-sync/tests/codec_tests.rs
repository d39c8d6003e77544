use pretty_assertions::assert_eq;
use synclog_sync::codec::{read_frame, write_frame, MAX_FRAME_SIZE};
use synclog_sync::SyncFrame;
use synclog_types::Entry;
use tokio::io::{duplex, AsyncWriteExt};

#[tokio::test]
async fn frames_cross_a_stream_in_order() {
    let (mut client, mut server) = duplex(64 * 1024);
    let frames = vec![
        SyncFrame::Pull {
            request_id: 1,
            since: 0,
            limit: 100,
        },
        SyncFrame::Push {
            request_id: 2,
            entries: vec![Entry::new("NoteEdited", "note:1", b"hello".to_vec())],
        },
        SyncFrame::Notify { head_sequence: 3 },
    ];

    for frame in &frames {
        write_frame(&mut client, frame).await.unwrap();
    }
    drop(client);

    let mut received = Vec::new();
    while let Some(frame) = read_frame(&mut server).await.unwrap() {
        received.push(frame);
    }
    assert_eq!(received, frames);
}

#[tokio::test]
async fn clean_eof_reads_none() {
    let (client, mut server) = duplex(1024);
    drop(client);
    assert!(read_frame(&mut server).await.unwrap().is_none());
}

#[tokio::test]
async fn eof_mid_frame_is_an_error() {
    let (mut client, mut server) = duplex(1024);
    client.write_all(&10u32.to_be_bytes()).await.unwrap();
    client.write_all(&[1, 2, 3]).await.unwrap();
    drop(client);
    assert!(read_frame(&mut server).await.is_err());
}

#[tokio::test]
async fn oversized_length_is_rejected() {
    let (mut client, mut server) = duplex(1024);
    let len = (MAX_FRAME_SIZE as u32) + 1;
    client.write_all(&len.to_be_bytes()).await.unwrap();
    let err = read_frame(&mut server).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[tokio::test]
async fn garbage_body_is_invalid_data() {
    let (mut client, mut server) = duplex(1024);
    client.write_all(&3u32.to_be_bytes()).await.unwrap();
    client.write_all(&[0xff, 0xff, 0xff]).await.unwrap();
    let err = read_frame(&mut server).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}
