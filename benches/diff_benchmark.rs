use criterion::{Criterion, black_box, criterion_group, criterion_main};
use image::DynamicImage;
use visual_regress::{Canvas, DiffOptions, diff_images};

fn screenshot(width: u32, height: u32, changed_rows: u32) -> DynamicImage {
    let mut canvas = Canvas::with_color(width, height, [240, 240, 240]);
    canvas.draw_rect(0, 0, width, 60, [30, 60, 120]);
    canvas.draw_text(16, 20, "Dashboard", 2, [255, 255, 255]);
    canvas.draw_rect(0, height / 2, width, changed_rows, [200, 30, 60]);
    DynamicImage::ImageRgb8(canvas.into_image())
}

fn benchmark_diff(c: &mut Criterion) {
    let options = DiffOptions::default();
    let reference = screenshot(1280, 800, 0);
    let identical = screenshot(1280, 800, 0);
    let changed = screenshot(1280, 800, 40);
    let taller = screenshot(1280, 900, 40);

    c.bench_function("diff_identical_1280x800", |b| {
        b.iter(|| diff_images(black_box(&reference), black_box(&identical), &options))
    });

    c.bench_function("diff_changed_1280x800", |b| {
        b.iter(|| diff_images(black_box(&reference), black_box(&changed), &options))
    });

    c.bench_function("diff_resized_1280x900", |b| {
        b.iter(|| diff_images(black_box(&reference), black_box(&taller), &options))
    });
}

criterion_group!(benches, benchmark_diff);
criterion_main!(benches);
