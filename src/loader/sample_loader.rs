use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::audio::SampleBuffer;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("could not read {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("malformed sample data in {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("unsupported format in {path}: {bits}-bit {format:?}")]
    Unsupported {
        path: PathBuf,
        bits: u16,
        format: hound::SampleFormat,
    },

    #[error("{path} has no audio channels")]
    NoChannels { path: PathBuf },
}

// Decode a WAV file into interleaved 16-bit PCM, keeping its own rate and channel count.
// Rate conversion happens at playback time in the render loop.
pub fn decode_wav(path: &Path) -> Result<SampleBuffer, DecodeError> {
    let mut reader = hound::WavReader::open(path).map_err(|source| DecodeError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let spec = reader.spec();
    if spec.channels == 0 {
        return Err(DecodeError::NoChannels { path: path.to_path_buf() });
    }
    let malformed = |source| DecodeError::Malformed { path: path.to_path_buf(), source };

    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(malformed)?,
        (hound::SampleFormat::Int, bits @ (8 | 24 | 32)) => {
            // shift down (or up, for 8-bit) to 16 significant bits
            let shift = bits as i32 - 16;
            reader
                .samples::<i32>()
                .map(|s| s.map(|x| if shift >= 0 { (x >> shift) as i16 } else { (x << -shift) as i16 }))
                .collect::<Result<Vec<_>, _>>()
                .map_err(malformed)?
        }
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|s| s.map(float_to_i16))
            .collect::<Result<Vec<_>, _>>()
            .map_err(malformed)?,
        (format, bits) => {
            return Err(DecodeError::Unsupported { path: path.to_path_buf(), bits, format });
        }
    };

    log::debug!(
        "decoded {}: {} ch, {} Hz, {} frames",
        path.display(),
        spec.channels,
        spec.sample_rate,
        samples.len() / spec.channels as usize
    );
    Ok(SampleBuffer::new(spec.channels, spec.sample_rate, samples))
}

fn float_to_i16(x: f32) -> i16 {
    (x.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

// Every .wav directly inside `dir`, sorted by file name.
pub fn index_wav_in_dir(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("wav"))
        })
        .collect();
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, spec: hound::WavSpec, write: impl FnOnce(&mut hound::WavWriter<std::io::BufWriter<std::fs::File>>)) {
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        write(&mut writer);
        writer.finalize().unwrap();
    }

    #[test]
    fn decodes_16_bit_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hit.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        write_wav(&path, spec, |w| {
            for s in [100i16, -100, 2000, -2000] {
                w.write_sample(s).unwrap();
            }
        });
        let buf = decode_wav(&path).unwrap();
        assert_eq!(buf.channels(), 2);
        assert_eq!(buf.sample_rate(), 22050);
        assert_eq!(buf.frame_count(), 2);
        assert_eq!(buf.samples(), &[100, -100, 2000, -2000]);
    }

    #[test]
    fn converts_float_and_24_bit_to_16_bit() {
        let dir = tempfile::tempdir().unwrap();
        let float_path = dir.path().join("f.wav");
        write_wav(
            &float_path,
            hound::WavSpec { channels: 1, sample_rate: 48000, bits_per_sample: 32, sample_format: hound::SampleFormat::Float },
            |w| {
                for s in [1.0f32, -2.0, 0.0] {
                    w.write_sample(s).unwrap();
                }
            },
        );
        assert_eq!(decode_wav(&float_path).unwrap().samples(), &[i16::MAX, -i16::MAX, 0]);

        let int24_path = dir.path().join("i24.wav");
        write_wav(
            &int24_path,
            hound::WavSpec { channels: 1, sample_rate: 48000, bits_per_sample: 24, sample_format: hound::SampleFormat::Int },
            |w| w.write_sample(0x10_0000i32).unwrap(),
        );
        assert_eq!(decode_wav(&int24_path).unwrap().samples(), &[0x1000]);
    }

    #[test]
    fn garbage_is_a_decode_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.wav");
        std::fs::write(&path, b"definitely not RIFF").unwrap();
        assert!(matches!(decode_wav(&path), Err(DecodeError::Open { .. })));
        assert!(decode_wav(&dir.path().join("missing.wav")).is_err());
    }

    #[test]
    fn indexes_only_wav_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.wav", "a.WAV", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let names: Vec<_> = index_wav_in_dir(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.WAV", "b.wav"]);
    }
}
