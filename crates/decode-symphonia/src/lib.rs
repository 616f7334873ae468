// Audio decoding using Symphonia

mod decoder;
mod demux;
pub mod sniff;

pub use decoder::{SymphoniaDecoder, SymphoniaDecoderFactory};
pub use sniff::{ContainerFormat, SNIFF_LEN};

#[cfg(test)]
mod tests {
    use super::*;
    use spool_core::{AudioError, ByteSource, DecodeStatus, DecoderFactory, FrameDecoder, SeekTarget};
    use spool_source_buffer::StreamingBuffer;
    use std::io::{self, Cursor, Read, Seek, SeekFrom};
    use std::thread;
    use std::time::Duration;

    /// Fully available in-memory source
    struct CursorSource(Cursor<Vec<u8>>);

    impl Read for CursorSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl Seek for CursorSource {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.0.seek(pos)
        }
    }

    impl ByteSource for CursorSource {
        fn byte_len(&self) -> Option<u64> {
            Some(self.0.get_ref().len() as u64)
        }

        fn has_bytes(&self, _min: usize) -> bool {
            true
        }

        fn peek_header(&self, len: usize) -> Option<Vec<u8>> {
            let data = self.0.get_ref();
            Some(data[..len.min(data.len())].to_vec())
        }
    }

    /// One second of a mono 8 kHz ramp
    fn wav_bytes() -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..8000i32 {
                writer.write_sample(((i % 200) * 100 - 10_000) as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    /// MPEG-1 Layer III, 128 kbit/s, 44.1 kHz mono: 417 bytes per frame
    const MP3_FRAME_LEN: usize = 417;

    /// Silent MP3 frames; the listed ones carry side info that cannot decode
    fn mp3_bytes(frames: usize, damaged: &[usize]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(frames * MP3_FRAME_LEN);
        for i in 0..frames {
            let mut frame = vec![0u8; MP3_FRAME_LEN];
            frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0xC0]);
            if damaged.contains(&i) {
                // Largest scalefac_compress with a zero part2_3_length
                frame[4 + 5] |= 0x01;
                frame[4 + 6] |= 0xE0;
            }
            bytes.extend(frame);
        }
        bytes
    }

    fn open(bytes: Vec<u8>) -> spool_core::Result<Box<dyn FrameDecoder>> {
        SymphoniaDecoderFactory.open(Box::new(CursorSource(Cursor::new(bytes))), Some("wav"))
    }

    fn decode_all(decoder: &mut dyn FrameDecoder) -> Vec<f32> {
        let mut samples = Vec::new();
        loop {
            match decoder.decode_next().unwrap() {
                DecodeStatus::Frame(frame) => samples.extend(frame.samples),
                DecodeStatus::EndOfStream => return samples,
                DecodeStatus::NeedMoreBytes => panic!("cursor source never runs dry"),
            }
        }
    }

    #[test]
    fn test_decode_wav() {
        let mut decoder = open(wav_bytes()).unwrap();
        let format = decoder.format();
        assert_eq!(format.sample_rate, 8000);
        assert_eq!(format.channels, 1);
        assert_eq!(format.bits_per_sample, Some(16));
        assert_eq!(format.duration_ms, Some(1000));

        let samples = decode_all(decoder.as_mut());
        assert_eq!(samples.len(), 8000);
        assert!((samples[0] - (-10_000.0 / 32768.0)).abs() < 1e-6);
        assert!((samples[150] - (5_000.0 / 32768.0)).abs() < 1e-6);
        assert!(decoder.take_frame_errors().is_empty());
    }

    #[test]
    fn test_seek_lands_at_or_before_target() {
        let mut decoder = open(wav_bytes()).unwrap();
        let actual = decoder.seek(SeekTarget::Time(500)).unwrap();
        assert!(actual <= 500 && actual >= 300, "landed at {}", actual);

        match decoder.decode_next().unwrap() {
            DecodeStatus::Frame(frame) => {
                let ts = frame.timestamp_ms() as i64;
                assert!((ts - actual as i64).abs() <= 1, "frame at {} vs {}", ts, actual);
            }
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn test_byte_seek_maps_to_time() {
        let bytes = wav_bytes();
        let half = bytes.len() as u64 / 2;
        let mut decoder = open(bytes).unwrap();
        let actual = decoder.seek(SeekTarget::Byte(half)).unwrap();
        assert!(actual <= 500 && actual >= 300, "landed at {}", actual);
    }

    #[test]
    fn test_malformed_header_is_format_error() {
        let err = open(b"this is not audio at all".to_vec()).err().unwrap();
        assert!(matches!(err, AudioError::DecoderFormat(_)));

        // Sniffs as WAV but the chunks are garbage
        let mut bogus = b"RIFF\x10\0\0\0WAVE".to_vec();
        bogus.extend_from_slice(&[0xAB; 64]);
        let err = open(bogus).err().unwrap();
        assert!(matches!(err, AudioError::DecoderFormat(_)));
    }

    #[test]
    fn test_decodes_while_bytes_trickle_in() {
        let bytes = wav_bytes();
        let buffer = StreamingBuffer::with_limits(64 * 1024, 1024, 32 * 1024, 16 * 1024);
        buffer.push(&bytes[..1000]);

        let producer = buffer.clone();
        let rest = bytes[1000..].to_vec();
        let handle = thread::spawn(move || {
            for chunk in rest.chunks(1000) {
                thread::sleep(Duration::from_millis(5));
                producer.push(chunk);
            }
            producer.mark_end_of_stream();
        });

        let mut decoder = SymphoniaDecoderFactory
            .open(Box::new(buffer.reader()), None)
            .unwrap();

        let mut frames = 0;
        loop {
            match decoder.decode_next().unwrap() {
                DecodeStatus::Frame(frame) => frames += frame.frames(),
                DecodeStatus::NeedMoreBytes => thread::sleep(Duration::from_millis(1)),
                DecodeStatus::EndOfStream => break,
            }
        }
        handle.join().unwrap();
        assert_eq!(frames, 8000);
    }

    #[test]
    fn test_corrupt_mp3_frame_is_skipped() {
        let mut decoder = SymphoniaDecoderFactory
            .open(Box::new(CursorSource(Cursor::new(mp3_bytes(12, &[5])))), Some("mp3"))
            .unwrap();
        assert_eq!(decoder.format().sample_rate, 44_100);

        let samples = decode_all(decoder.as_mut());
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| s.abs() < 1e-3));
        assert_eq!(decoder.take_frame_errors().len(), 1);
    }

    #[test]
    fn test_endless_corruption_gives_up() {
        let mut decoder = SymphoniaDecoderFactory
            .open(
                Box::new(CursorSource(Cursor::new(mp3_bytes(100, &(2..100).collect::<Vec<_>>())))),
                Some("mp3"),
            )
            .unwrap();

        let mut yields = 0;
        let err = loop {
            match decoder.decode_next() {
                Ok(DecodeStatus::NeedMoreBytes) => yields += 1,
                Ok(DecodeStatus::Frame(_)) => {}
                Ok(DecodeStatus::EndOfStream) => panic!("damage should stop decoding first"),
                Err(e) => break e,
            }
            assert!(yields < 100, "decoder never gave up");
        };
        assert!(matches!(err, AudioError::DecoderFrame(_)));
        assert!(yields >= 1);
        assert!(decoder.take_frame_errors().len() >= 8);
    }
}
