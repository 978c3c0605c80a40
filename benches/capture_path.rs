use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use parley::audio::{
    Debounce, EnergyClassifier, EnergyClassifierConfig, RingBuffer, SpeechClassifier, VadConfig,
    VoiceActivityDetector,
};
use std::hint::black_box;

const FRAME: usize = 480;
const SAMPLE_RATE: u32 = 16000;

/// Half a second of silence, one second of a 220Hz-ish square wave, repeated.
fn scripted_frames(count: usize) -> Vec<Vec<i16>> {
    (0..count)
        .map(|i| {
            if i % 50 < 17 {
                vec![0; FRAME]
            } else {
                (0..FRAME)
                    .map(|n| if (n / 36) % 2 == 0 { 3000 } else { -3000 })
                    .collect()
            }
        })
        .collect()
}

/// Everything the capture thread does per frame: buffer, classify, debounce.
fn bench_capture_step(c: &mut Criterion) {
    let frames = scripted_frames(500);
    let mut group = c.benchmark_group("capture_step");

    for auto_level in [false, true] {
        group.bench_with_input(
            BenchmarkId::new("ring+classify+debounce", auto_level),
            &auto_level,
            |b, &auto_level| {
                let ring = RingBuffer::new(SAMPLE_RATE as usize * 30, SAMPLE_RATE);
                let mut classifier = EnergyClassifier::new(EnergyClassifierConfig {
                    auto_level,
                    ..EnergyClassifierConfig::default()
                });
                let mut debounce = Debounce::new(VadConfig::default());
                b.iter(|| {
                    for frame in &frames {
                        let position = ring.write(frame);
                        let classification = classifier.classify(frame);
                        black_box((position, debounce.update(classification.is_speech)));
                    }
                });
            },
        );
    }
    group.finish();
}

fn bench_vad(c: &mut Criterion) {
    let frames = scripted_frames(500);
    c.bench_function("vad_process_500_frames", |b| {
        let mut vad =
            VoiceActivityDetector::new(EnergyClassifierConfig::default(), VadConfig::default());
        b.iter(|| {
            for frame in &frames {
                black_box(vad.process(frame));
            }
        });
    });
}

fn bench_utterance_extraction(c: &mut Criterion) {
    let ring = RingBuffer::new(SAMPLE_RATE as usize * 30, SAMPLE_RATE);
    for frame in scripted_frames(1000) {
        ring.write(&frame);
    }
    let end = ring.position();
    c.bench_function("read_span_5s", |b| {
        b.iter(|| black_box(ring.read_span(end - 5 * u64::from(SAMPLE_RATE), end)));
    });
}

criterion_group!(benches, bench_capture_step, bench_vad, bench_utterance_extraction);
criterion_main!(benches);
