use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use image::{DynamicImage, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::SeedableRng;
use ssd_data::boxes::{Encoder, DEFAULT_CRITERION};
use ssd_data::transforms::{build_transform, Annotated, Mode, Transform};

/// Benchmarks for the per-sample SSD300 work done by loader workers.
///
/// This measures:
/// 1. The full train and eval transforms on COCO-sized images
/// 2. Matching ground-truth boxes against the 8732 default boxes
///
/// ```bash
/// cargo bench --bench transform_bench
/// ```

/// Typical COCO resolutions, (width, height).
const SIZES: [(u32, u32); 2] = [(640, 480), (1024, 768)];

fn make_annotated(width: u32, height: u32, num_boxes: usize) -> Annotated<DynamicImage> {
    let image = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
    let boxes = (0..num_boxes)
        .map(|i| {
            let offset = 0.05 * (i % 8) as f32;
            [offset, offset, offset + 0.3, offset + 0.4]
        })
        .collect::<Vec<_>>();
    Annotated {
        image: DynamicImage::ImageRgb8(image),
        image_id: 1,
        size: (height, width),
        labels: (0..num_boxes as i64).map(|i| 1 + i % 80).collect(),
        boxes,
    }
}

fn bench_transforms(c: &mut Criterion) {
    let mut group = c.benchmark_group("SsdTransform");
    group.throughput(Throughput::Elements(1));

    for mode in [Mode::Train, Mode::Eval] {
        let (_dboxes, transform) = build_transform(mode).expect("default boxes");
        for &(width, height) in &SIZES {
            let input = make_annotated(width, height, 6);
            let id = BenchmarkId::new(format!("{:?}", mode), format!("{}x{}", width, height));
            group.bench_with_input(id, &input, |b, input| {
                let mut rng = StdRng::seed_from_u64(0);
                b.iter(|| {
                    let sample = transform.apply(input.clone(), &mut rng).expect("transform");
                    black_box(sample)
                })
            });
        }
    }
    group.finish();
}

fn bench_encoder(c: &mut Criterion) {
    let mut group = c.benchmark_group("Encoder");
    let (dboxes, _transform) = build_transform(Mode::Train).expect("default boxes");
    let encoder = Encoder::new(&dboxes);

    for num_boxes in [1usize, 8, 32] {
        let input = make_annotated(8, 8, num_boxes);
        group.bench_with_input(BenchmarkId::from_parameter(num_boxes), &input, |b, input| {
            b.iter(|| {
                let encoded = encoder
                    .encode(&input.boxes, &input.labels, DEFAULT_CRITERION)
                    .expect("encode");
                black_box(encoded)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_transforms, bench_encoder);
criterion_main!(benches);
