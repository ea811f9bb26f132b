mod common;

use std::fs::File;
use std::io::{Cursor, Write};

use baseband::formats::{Header, TextHeader};
use baseband::quantization::Coding;
use baseband::source::SequentialFile;
use baseband::stream::StreamOptions;
use baseband::{Error, Quantization, ReadPolicy, Registry, SampleStream, SeekTarget, WriterOptions};
use common::*;
use hifitime::Duration;
use ndarray::{s, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn two_bit() -> Quantization {
    Quantization::new(2, false, Coding::OffsetBinary).unwrap()
}

fn open(data: Vec<u8>, format: &str, options: StreamOptions) -> SampleStream<Cursor<Vec<u8>>> {
    SampleStream::open(vec![Cursor::new(data)], format, options).unwrap()
}

// 8 channels, 100 samples per frame, 232-byte frames at 100 frames per second
fn vdif_data(seed: u64, nsamp: usize) -> (Array3<f32>, Vec<u8>) {
    let block = two_bit_block(seed, (nsamp, 8, 1));
    let bytes = write_stream("vdif", vdif_options(8, two_bit(), 100, 10_000.0), &block);
    (block, bytes)
}

#[test]
fn vdif_round_trip() {
    let (block, bytes) = vdif_data(1, 250);
    assert_eq!(bytes.len(), 3 * 232);

    let mut stream = open(bytes, "vdif", StreamOptions::default());
    assert_eq!(stream.samples_per_frame(), 100);
    assert_eq!(stream.shape(), (300, 8, 1));
    assert_eq!(stream.start_time().unwrap(), start());

    let got = stream.read(250).unwrap();
    assert!(got.is_complete());
    assert_eq!(got.data, block);
}

#[test]
fn mark5b_round_trip() {
    let quant = Quantization::new(2, false, Coding::SignMagnitude).unwrap();
    let block = two_bit_block(2, (25_000, 4, 1));
    let options = WriterOptions::builder()
        .start_time(start())
        .sample_rate(1e6)
        .nchan(4)
        .quantization(quant)
        .build();
    let bytes = write_stream("mark5b", options, &block);
    assert_eq!(bytes.len(), 3 * 10_016);

    let options = StreamOptions::builder()
        .nchan(4)
        .ref_mjd(56_800)
        .sample_rate(1e6)
        .build();
    let mut stream = open(bytes, "mark5b", options);
    assert_eq!(stream.samples_per_frame(), 10_000);
    assert_eq!(stream.num_samples(), 30_000);
    assert_eq!(stream.start_time().unwrap(), start());

    let got = stream.read(25_000).unwrap();
    assert!(got.is_complete());
    assert_eq!(got.data, block);
}

#[test]
fn dada_round_trip_records_valid_samples() {
    let quant = Quantization::new(8, false, Coding::TwosComplement).unwrap();
    let block = eight_bit_block(3, (150, 2, 1));
    let options = WriterOptions::builder()
        .start_time(start())
        .sample_rate(1000.0)
        .nchan(2)
        .quantization(quant)
        .samples_per_frame(64)
        .build();
    let bytes = write_stream("dada", options, &block);
    assert_eq!(bytes.len(), 3 * (4096 + 128));

    // frame rate comes from TSAMP
    let mut stream = open(bytes, "dada", StreamOptions::default());
    assert_eq!(stream.sample_rate(), Some(1000.0));
    assert_eq!(stream.num_samples(), 150);

    let got = stream.read(160).unwrap();
    assert_eq!(got.data.slice(s![..150, .., ..]), block);
    assert_eq!(got.exhausted, 10);
    assert_eq!(got.filled(), 20);
    assert!(got.data[[155, 1, 0]].is_nan());
}

#[test]
fn seek_then_read_matches_sequential_read() {
    let (block, bytes) = vdif_data(4, 600);
    let mut stream = open(bytes, "vdif", StreamOptions::default());
    let mut rng = StdRng::seed_from_u64(5);

    for _ in 0..20 {
        let offset = rng.gen_range(0..600usize);
        let n = rng.gen_range(1..=600 - offset);
        assert_eq!(
            stream.seek(SeekTarget::Start(offset as u64)).unwrap(),
            offset as u64
        );
        let got = stream.read(n).unwrap();
        assert_eq!(got.data, block.slice(s![offset..offset + n, .., ..]));
        assert_eq!(stream.tell(), (offset + n) as u64);
    }
}

#[test]
fn seek_by_time() {
    let (block, bytes) = vdif_data(6, 300);
    let options = StreamOptions::builder().sample_rate(10_000.0).build();
    let mut stream = open(bytes, "vdif", options);
    assert_eq!(stream.sample_rate(), Some(10_000.0));

    let target = start() + Duration::from_seconds(0.015);
    assert_eq!(stream.seek(SeekTarget::Time(target)).unwrap(), 150);
    assert_eq!(stream.tell_time().unwrap(), target);
    let got = stream.read(10).unwrap();
    assert_eq!(got.data, block.slice(s![150..160, .., ..]));
}

#[test]
fn missing_frames_are_filled() {
    let (block, bytes) = vdif_data(7, 300);
    // drop the middle frame
    let mut data = bytes[..232].to_vec();
    data.extend_from_slice(&bytes[464..]);

    let options = StreamOptions::builder()
        .sample_rate(10_000.0)
        .fill_value(0.0)
        .build();
    let mut stream = open(data.clone(), "vdif", options);
    assert_eq!(stream.num_samples(), 300);

    let got = stream.read(300).unwrap();
    assert_eq!(got.filled(), 100 * 8);
    assert_eq!(got.exhausted, 0);
    assert!(got.data.slice(s![100..200, .., ..]).iter().all(|v| *v == 0.0));
    assert_eq!(got.data.slice(s![200.., .., ..]), block.slice(s![200.., .., ..]));

    let options = StreamOptions::builder()
        .sample_rate(10_000.0)
        .policy(ReadPolicy::Strict)
        .build();
    let mut stream = open(data, "vdif", options);
    assert!(matches!(stream.read(300), Err(Error::Gap { frame: 1 })));
    assert_eq!(stream.tell(), 0);
}

#[test]
fn truncated_final_frame() {
    let (_, mut bytes) = vdif_data(8, 300);
    bytes.truncate(bytes.len() - 10);

    let mut stream = open(bytes, "vdif", StreamOptions::builder().sample_rate(10_000.0).build());
    assert_eq!(stream.num_samples(), 200);
    assert!(stream.read(200).unwrap().is_complete());
    assert!(matches!(
        stream.read(10),
        Err(Error::TruncatedFrame { offset: 464, .. })
    ));
}

#[test]
fn oversized_final_header_is_truncation() {
    let quant = Quantization::new(8, false, Coding::TwosComplement).unwrap();
    let block = eight_bit_block(15, (64, 2, 1));
    let options = WriterOptions::builder()
        .start_time(start())
        .sample_rate(1000.0)
        .nchan(2)
        .quantization(quant)
        .samples_per_frame(32)
        .build();
    let mut bytes = write_stream("dada", options, &block);
    assert_eq!(bytes.len(), 2 * (4096 + 64));
    let mut header = TextHeader::parse(&bytes[..4096]);
    header.set("FILE_SIZE", "17592186044416").unwrap();
    bytes.extend(Header::Text(header).to_bytes());

    let mut stream = open(bytes, "dada", StreamOptions::default());
    assert_eq!(stream.num_samples(), 64);
    assert_eq!(stream.read(64).unwrap().data, block);
    assert!(matches!(
        stream.read(32),
        Err(Error::TruncatedFrame { offset: 8320, .. })
    ));
}

#[test]
fn lost_bytes_do_not_misalign_later_frames() {
    let quant = Quantization::new(2, false, Coding::SignMagnitude).unwrap();
    let block = two_bit_block(16, (40_000, 4, 1));
    let options = WriterOptions::builder()
        .start_time(start())
        .sample_rate(1e6)
        .nchan(4)
        .quantization(quant)
        .build();
    let mut data = write_stream("mark5b", options, &block);
    assert_eq!(data.len(), 4 * 10_016);
    // frame 1 loses 100 payload bytes
    data.drain(10_016 + 16 + 500..10_016 + 16 + 600);

    let options = StreamOptions::builder()
        .nchan(4)
        .ref_mjd(56_800)
        .sample_rate(1e6)
        .build();
    let mut stream = open(data, "mark5b", options);
    assert_eq!(stream.num_samples(), 40_000);

    let got = stream.read(40_000).unwrap();
    assert_eq!(got.exhausted, 0);
    assert!(got.valid.slice(s![20_000.., ..]).iter().all(|v| *v));
    assert_eq!(
        got.data.slice(s![..10_000, .., ..]),
        block.slice(s![..10_000, .., ..])
    );
    assert_eq!(
        got.data.slice(s![20_000.., .., ..]),
        block.slice(s![20_000.., .., ..])
    );
}

#[test]
fn invalid_frames_read_as_gaps() {
    let (block, mut data) = vdif_data(17, 300);
    // invalid flag, bit 31 of word 0
    data[232 + 3] |= 0x80;

    let options = StreamOptions::builder()
        .sample_rate(10_000.0)
        .fill_value(0.0)
        .build();
    let mut stream = open(data.clone(), "vdif", options);
    let got = stream.read(300).unwrap();
    assert_eq!(got.filled(), 100 * 8);
    assert!(got.valid.slice(s![100..200, ..]).iter().all(|v| !*v));
    assert!(got.data.slice(s![100..200, .., ..]).iter().all(|v| *v == 0.0));
    assert_eq!(got.data.slice(s![..100, .., ..]), block.slice(s![..100, .., ..]));
    assert_eq!(got.data.slice(s![200.., .., ..]), block.slice(s![200.., .., ..]));

    let options = StreamOptions::builder()
        .sample_rate(10_000.0)
        .policy(ReadPolicy::Strict)
        .build();
    let mut stream = open(data, "vdif", options);
    assert!(matches!(stream.read(300), Err(Error::Gap { frame: 1 })));
}

#[test]
fn leading_garbage_is_skipped() {
    let (block, bytes) = vdif_data(9, 200);
    let mut data = vec![0u8; 37];
    data.extend_from_slice(&bytes);

    let mut stream = open(data, "vdif", StreamOptions::default());
    assert_eq!(stream.num_samples(), 200);
    assert_eq!(stream.read(200).unwrap().data, block);
}

#[test]
fn threads_read_in_lock_step() {
    let quant = two_bit();
    let a = two_bit_block(10, (300, 8, 1));
    let b = two_bit_block(11, (300, 8, 1));
    let mut options = vdif_options(8, quant, 100, 10_000.0);
    let bytes_a = write_stream("vdif", options.clone(), &a);
    options.thread_id = 1;
    let bytes_b = write_stream("vdif", options, &b);

    let data: Vec<u8> = bytes_a
        .chunks(232)
        .zip(bytes_b.chunks(232))
        .flat_map(|(x, y)| [x, y].concat())
        .collect();
    let options = StreamOptions::builder().threads(vec![1, 0]).build();
    let mut stream = SampleStream::open(
        vec![Cursor::new(data.clone()), Cursor::new(data)],
        "vdif",
        options,
    )
    .unwrap();
    assert_eq!(stream.shape(), (300, 16, 1));
    assert_eq!(stream.info().threads, vec![1, 0]);

    stream.seek(SeekTarget::Start(150)).unwrap();
    let got = stream.read(100).unwrap();
    assert_eq!(got.data.slice(s![.., ..8, ..]), b.slice(s![150..250, .., ..]));
    assert_eq!(got.data.slice(s![.., 8.., ..]), a.slice(s![150..250, .., ..]));
}

#[test]
fn missing_thread_frame_fills_only_its_channels() {
    let a = two_bit_block(13, (300, 8, 1));
    let b = two_bit_block(14, (300, 8, 1));
    let mut options = vdif_options(8, two_bit(), 100, 10_000.0);
    let bytes_a = write_stream("vdif", options.clone(), &a);
    options.thread_id = 1;
    let bytes_b = write_stream("vdif", options, &b);

    // thread 1 loses its second frame
    let mut data = Vec::new();
    for (i, (x, y)) in bytes_a.chunks(232).zip(bytes_b.chunks(232)).enumerate() {
        data.extend_from_slice(x);
        if i != 1 {
            data.extend_from_slice(y);
        }
    }
    let options = StreamOptions::builder()
        .threads(vec![1, 0])
        .fill_value(0.0)
        .build();
    let mut stream = SampleStream::open(
        vec![Cursor::new(data.clone()), Cursor::new(data)],
        "vdif",
        options,
    )
    .unwrap();
    assert_eq!(stream.num_samples(), 300);

    let got = stream.read(300).unwrap();
    assert_eq!(got.filled(), 100 * 8);
    assert_eq!(got.exhausted, 0);
    assert!(got.valid.slice(s![100..200, ..8]).iter().all(|v| !*v));
    assert!(got.valid.slice(s![.., 8..]).iter().all(|v| *v));
    assert_eq!(got.data.slice(s![.., 8.., ..]), a);
    assert_eq!(got.data.slice(s![200.., ..8, ..]), b.slice(s![200.., .., ..]));
}

#[test]
fn files_read_as_one_source() {
    let (block, bytes) = vdif_data(12, 500);
    let dir = tempfile::tempdir().unwrap();
    let mut paths = Vec::new();
    // split away from frame boundaries
    for (i, chunk) in [&bytes[..300], &bytes[300..301], &bytes[301..]].iter().enumerate() {
        let path = dir.path().join(format!("scan.{i}.vdif"));
        File::create(&path).unwrap().write_all(chunk).unwrap();
        paths.push(path);
    }
    assert_eq!(SequentialFile::open(&paths).unwrap().len(), bytes.len() as u64);

    let mut stream =
        SampleStream::open_sequential(&paths, "vdif", StreamOptions::default()).unwrap();
    assert_eq!(stream.num_samples(), 500);
    assert_eq!(stream.read(500).unwrap().data, block);

    let mut stream =
        SampleStream::open_paths(&paths[..1], "vdif", StreamOptions::default()).unwrap();
    assert_eq!(stream.num_samples(), 100);
    assert!(stream.read(100).unwrap().is_complete());
}

#[test]
fn custom_registry_formats() {
    let mut registry = Registry::default();
    registry
        .register_json(
            r#"{
                "name": "ten",
                "frame_size": {"fixed": 110},
                "header_size": {"fixed": 10},
                "layout": {
                    "word_bytes": 2,
                    "words": 5,
                    "endian": "big",
                    "fields": [
                        {"name": "sync", "word": 0, "bit": 0, "width": 16, "default": 48879},
                        {"name": "seconds", "word": 1, "bit": 0, "width": 32},
                        {"name": "frame_nr", "word": 3, "bit": 0, "width": 16}
                    ]
                },
                "quantization": {"bits": 8, "complex": false, "coding": "twos_complement"},
                "nchan": 1
            }"#,
        )
        .unwrap();

    let mut data = Vec::new();
    for frame_nr in 0..2u8 {
        data.extend_from_slice(&[0xbe, 0xef, 0x53, 0x70, 0x00, 0x00, 0x00, frame_nr, 0, 0]);
        data.extend((0..100u8).map(|i| i.wrapping_add(frame_nr * 100)));
    }
    let mut stream = SampleStream::open_with(
        &registry,
        vec![Cursor::new(data)],
        "ten",
        StreamOptions::default(),
    )
    .unwrap();
    assert_eq!(stream.shape(), (200, 1, 1));

    let got = stream.read(200).unwrap();
    assert!(got.is_complete());
    for i in 0..200 {
        assert_eq!(got.data[[i, 0, 0]], f32::from(i as u8 as i8), "sample {i}");
    }
}

#[test]
fn unknown_format_fails_before_reading() {
    let err = SampleStream::open(vec![Untouchable], "vdif2000", StreamOptions::default())
        .err()
        .unwrap();
    assert!(matches!(err, Error::UnsupportedFormat(name) if name == "vdif2000"));

    let err = SampleStream::<Untouchable>::open(Vec::new(), "vdif", StreamOptions::default())
        .err()
        .unwrap();
    assert!(matches!(err, Error::Config(_)));
}
